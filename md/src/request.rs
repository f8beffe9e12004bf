//! Typed requests to the local service
//!
//! Each local operation declares which fields it accepts and which it needs.
//! `TaskRequest::build` validates a plain field map against those tables and
//! reports every missing and disallowed field at once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ValidationError;
use crate::task::TaskKeys;

/// One required-field rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    One(&'static str),
    /// At least one of the listed fields
    AnyOf(&'static [&'static str]),
}

impl FieldRule {
    fn is_satisfied(&self, fields: &Map<String, Value>) -> bool {
        match self {
            FieldRule::One(name) => has_value(fields, name),
            FieldRule::AnyOf(names) => names.iter().any(|n| has_value(fields, n)),
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldRule::One(name) => name.to_string(),
            FieldRule::AnyOf(names) => names.join("|"),
        }
    }
}

fn has_value(fields: &Map<String, Value>, name: &str) -> bool {
    match fields.get(name) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn check_fields(
    allowed: &[&str],
    required: &[FieldRule],
    fields: &Map<String, Value>,
) -> Result<(), ValidationError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|rule| !rule.is_satisfied(fields))
        .map(FieldRule::describe)
        .collect();
    let mut disallowed: Vec<String> = fields
        .keys()
        .filter(|k| !allowed.contains(&k.as_str()))
        .cloned()
        .collect();
    disallowed.sort();
    match ValidationError::from_fields(missing, disallowed) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn project(allowed: &[&str], fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(k, _)| allowed.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Operations the local service performs as tasks
///
/// Every variant is part of the local service contract. `UpdatePersonIdentifiers`
/// is reserved: no packet handler submits it yet, but its request table is
/// kept so a local service can be validated against the full operation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChooseOrAddOrg,
    ChooseOrAddPerson,
    ActivatePerson,
    /// Reserved; not submitted by any handler
    UpdatePersonIdentifiers,
    MergePerson,
    ChooseOrAddGrant,
    ChooseOrAddLocalFos,
    ChooseOrAddProjectNameBase,
    CreateProject,
    InactivateProject,
    ReactivateProject,
    CreateAccount,
    InactivateAccount,
    ReactivateAccount,
    UpdateAllocation,
    ModifyUser,
    NotifyUser,
}

use FieldRule::{AnyOf, One};

const PERSON_FIELDS: &[&str] = &[
    "AcademicDegree",
    "BusinessPhoneComment",
    "BusinessPhoneExtension",
    "BusinessPhoneNumber",
    "CitizenshipList",
    "City",
    "Country",
    "Department",
    "Email",
    "FirstName",
    "GlobalID",
    "HomePhoneComment",
    "HomePhoneExtension",
    "HomePhoneNumber",
    "LastName",
    "MiddleName",
    "Organization",
    "OrgCode",
    "SitePersonID",
    "State",
    "Title",
    "RemoteSiteLogin",
    "RequestedLoginList",
    "person_role",
];

const USER_MODIFY_FIELDS: &[&str] = &[
    "ActionType",
    "AcademicDegree",
    "BusinessPhoneComment",
    "BusinessPhoneExtension",
    "BusinessPhoneNumber",
    "CitizenshipList",
    "City",
    "Country",
    "Department",
    "DnList",
    "Email",
    "FirstName",
    "HomePhoneComment",
    "HomePhoneExtension",
    "HomePhoneNumber",
    "LastName",
    "MiddleName",
    "NsfStatusCode",
    "Organization",
    "OrgCode",
    "PersonID",
    "State",
    "StreetAddress",
    "StreetAddress2",
    "Title",
    "Zip",
];

const PROJECT_NAME_BASE_FIELDS: &[&str] = &[
    "BoardType",
    "ChargeNumber",
    "GrantNumber",
    "GrantType",
    "NsfStatusCode",
    "PfosNumber",
    "PiCity",
    "PiCountry",
    "PiPersonID",
    "PiOrganization",
    "PiOrgCode",
    "PiState",
    "ProjectID",
    "ProjectTitle",
    "site_org",
    "site_grant_key",
];

impl Operation {
    pub const ALL: &'static [Operation] = &[
        Operation::ChooseOrAddOrg,
        Operation::ChooseOrAddPerson,
        Operation::ActivatePerson,
        Operation::UpdatePersonIdentifiers,
        Operation::MergePerson,
        Operation::ChooseOrAddGrant,
        Operation::ChooseOrAddLocalFos,
        Operation::ChooseOrAddProjectNameBase,
        Operation::CreateProject,
        Operation::InactivateProject,
        Operation::ReactivateProject,
        Operation::CreateAccount,
        Operation::InactivateAccount,
        Operation::ReactivateAccount,
        Operation::UpdateAllocation,
        Operation::ModifyUser,
        Operation::NotifyUser,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::ChooseOrAddOrg => "choose_or_add_org",
            Operation::ChooseOrAddPerson => "choose_or_add_person",
            Operation::ActivatePerson => "activate_person",
            Operation::UpdatePersonIdentifiers => "update_person_identifiers",
            Operation::MergePerson => "merge_person",
            Operation::ChooseOrAddGrant => "choose_or_add_grant",
            Operation::ChooseOrAddLocalFos => "choose_or_add_local_fos",
            Operation::ChooseOrAddProjectNameBase => "choose_or_add_project_name_base",
            Operation::CreateProject => "create_project",
            Operation::InactivateProject => "inactivate_project",
            Operation::ReactivateProject => "reactivate_project",
            Operation::CreateAccount => "create_account",
            Operation::InactivateAccount => "inactivate_account",
            Operation::ReactivateAccount => "reactivate_account",
            Operation::UpdateAllocation => "update_allocation",
            Operation::ModifyUser => "modify_user",
            Operation::NotifyUser => "notify_user",
        }
    }

    /// Fields the operation accepts, beyond the task keys
    pub fn allowed(self) -> &'static [&'static str] {
        match self {
            Operation::ChooseOrAddOrg => &["City", "Country", "Organization", "OrgCode", "State"],
            Operation::ChooseOrAddPerson => PERSON_FIELDS,
            Operation::ActivatePerson => &[
                "Email",
                "FirstName",
                "GlobalID",
                "LastName",
                "MiddleName",
                "PersonID",
                "SitePersonID",
                "RemoteSiteLogin",
                "person_role",
            ],
            Operation::UpdatePersonIdentifiers => &["PersonID", "GlobalID", "DnList"],
            Operation::MergePerson => &[
                "KeepGlobalID",
                "DeleteGlobalID",
                "KeepPersonID",
                "DeletePersonID",
                "KeepPortalLogin",
                "DeletePortalLogin",
            ],
            Operation::ChooseOrAddGrant => &[
                "GrantNumber",
                "GrantType",
                "PfosNumber",
                "local_fos",
                "PiPersonID",
                "PiFirstName",
                "PiLastName",
                "PiDepartment",
                "ProjectTitle",
                "StartDate",
                "EndDate",
            ],
            Operation::ChooseOrAddLocalFos => &["Abstract", "GrantNumber", "PfosNumber", "ProjectTitle", "PiDepartment"],
            Operation::ChooseOrAddProjectNameBase => PROJECT_NAME_BASE_FIELDS,
            Operation::CreateProject => &[
                "local_fos",
                "project_name_base",
                "site_grant_key",
                "site_org",
                "Abstract",
                "AllocatedResource",
                "BoardType",
                "ChargeNumber",
                "EndDate",
                "GrantNumber",
                "GrantType",
                "NsfStatusCode",
                "PfosNumber",
                "PiPersonID",
                "ProjectID",
                "ProjectTitle",
                "RecordID",
                "RemoteSiteLogin",
                "Resource",
                "RoleList",
                "ServiceUnitsAllocated",
                "Sfos",
                "StartDate",
            ],
            Operation::InactivateProject => &[
                "site_grant_key",
                "GrantNumber",
                "AllocatedResource",
                "Comment",
                "EndDate",
                "ProjectID",
                "Resource",
                "ServiceUnitsAllocated",
                "ServiceUnitsRemaining",
                "StartDate",
            ],
            Operation::ReactivateProject => &[
                "GrantNumber",
                "AllocatedResource",
                "Comment",
                "EndDate",
                "PiPersonID",
                "ProjectID",
                "Resource",
                "ServiceUnitsAllocated",
                "ServiceUnitsRemaining",
                "StartDate",
            ],
            Operation::CreateAccount => &["site_grant_key", "GrantNumber", "ProjectID", "PersonID", "Resource"],
            Operation::InactivateAccount | Operation::ReactivateAccount => {
                &["Comment", "PersonID", "ProjectID", "Resource"]
            }
            Operation::UpdateAllocation => &[
                "AllocationType",
                "EndDate",
                "ProjectID",
                "Resource",
                "ServiceUnitsAllocated",
                "StartDate",
            ],
            Operation::ModifyUser => USER_MODIFY_FIELDS,
            Operation::NotifyUser => &[
                "BusinessPhoneNumber",
                "contingent_resources",
                "Email",
                "PersonID",
                "person_id",
                "project_id",
                "ProjectID",
                "RemoteSiteLogin",
                "Resource",
                "ResourceList",
                "resource_name",
                "Username",
            ],
        }
    }

    pub fn required(self) -> &'static [FieldRule] {
        match self {
            Operation::ChooseOrAddOrg => &[AnyOf(&["OrgCode", "Organization"])],
            Operation::ChooseOrAddPerson => &[AnyOf(&["FirstName", "LastName"]), One("Organization")],
            Operation::ActivatePerson | Operation::UpdatePersonIdentifiers => &[One("PersonID")],
            Operation::MergePerson => &[
                One("KeepGlobalID"),
                One("DeleteGlobalID"),
                One("KeepPersonID"),
                One("DeletePersonID"),
            ],
            Operation::ChooseOrAddGrant => &[
                One("GrantNumber"),
                One("PfosNumber"),
                One("PiPersonID"),
                One("PiFirstName"),
                One("PiLastName"),
                One("StartDate"),
                One("EndDate"),
            ],
            Operation::ChooseOrAddLocalFos => &[One("PfosNumber")],
            Operation::ChooseOrAddProjectNameBase => &[
                One("GrantNumber"),
                One("PfosNumber"),
                One("PiOrganization"),
                One("PiOrgCode"),
                One("site_grant_key"),
            ],
            Operation::CreateProject => &[
                One("local_fos"),
                One("project_name_base"),
                One("site_grant_key"),
                One("EndDate"),
                One("GrantNumber"),
                One("PfosNumber"),
                One("PiPersonID"),
                One("RemoteSiteLogin"),
                One("Resource"),
                One("ServiceUnitsAllocated"),
                One("StartDate"),
            ],
            Operation::InactivateProject | Operation::ReactivateProject => &[One("ProjectID"), One("Resource")],
            Operation::CreateAccount => &[AnyOf(&["ProjectID", "site_grant_key"]), One("PersonID"), One("Resource")],
            Operation::InactivateAccount | Operation::ReactivateAccount => {
                &[One("PersonID"), One("ProjectID"), One("Resource")]
            }
            Operation::UpdateAllocation => &[
                One("AllocationType"),
                One("EndDate"),
                One("ProjectID"),
                One("Resource"),
                One("ServiceUnitsAllocated"),
                One("StartDate"),
            ],
            Operation::ModifyUser => &[One("ActionType"), One("PersonID")],
            Operation::NotifyUser => &[
                AnyOf(&["project_id", "ProjectID"]),
                AnyOf(&["person_id", "RemoteSiteLogin"]),
                AnyOf(&["Resource", "ResourceList", "resource_name"]),
            ],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entities the local service can look up without creating a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    Org,
    Person,
    Grant,
    LocalFos,
    ProjectNameBase,
    /// A project already provisioned for a request's `RecordID`
    ProjectTask,
}

impl LookupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupKind::Org => "org",
            LookupKind::Person => "person",
            LookupKind::Grant => "grant",
            LookupKind::LocalFos => "local_fos",
            LookupKind::ProjectNameBase => "project_name_base",
            LookupKind::ProjectTask => "project_task",
        }
    }

    pub fn allowed(self) -> &'static [&'static str] {
        match self {
            LookupKind::Org => &["OrgCode"],
            LookupKind::Person => &["PersonID", "GlobalID"],
            LookupKind::Grant => &["GrantNumber"],
            LookupKind::LocalFos => &["PfosNumber"],
            LookupKind::ProjectNameBase => PROJECT_NAME_BASE_FIELDS,
            LookupKind::ProjectTask => &["RecordID"],
        }
    }

    pub fn required(self) -> &'static [FieldRule] {
        match self {
            LookupKind::Org => &[One("OrgCode")],
            LookupKind::Person => &[],
            LookupKind::Grant => &[One("GrantNumber")],
            LookupKind::LocalFos => &[One("PfosNumber")],
            LookupKind::ProjectNameBase => &[
                One("GrantNumber"),
                One("PfosNumber"),
                One("PiOrganization"),
                AnyOf(&["PiOrgCode", "site_org"]),
                One("site_grant_key"),
            ],
            LookupKind::ProjectTask => &[One("RecordID")],
        }
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whose fields a person or organization request describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Pi,
}

impl Role {
    pub fn prefix(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Pi => "Pi",
        }
    }

    fn snake_prefix(self) -> &'static str {
        match self {
            Role::User => "user_",
            Role::Pi => "pi_",
        }
    }
}

/// Copy `fields`, removing the role prefix from keys
///
/// `UserFirstName` becomes `FirstName` and `pi_person_id` becomes
/// `person_id`. A key whose remainder starts with a lowercase letter, such as
/// `Username`, is left alone. Stripped keys take precedence over unprefixed
/// keys of the same name.
pub fn strip_role_prefix(role: Role, fields: &Map<String, Value>) -> Map<String, Value> {
    let prefix = role.prefix();
    let snake = role.snake_prefix();
    let mut plain = Map::new();
    let mut stripped = Map::new();
    for (key, value) in fields {
        if let Some(rest) = key.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with(|c: char| c.is_lowercase()) {
                plain.insert(key.clone(), value.clone());
            } else {
                stripped.insert(rest.to_string(), value.clone());
            }
        } else if let Some(rest) = key.strip_prefix(snake) {
            if rest.is_empty() {
                plain.insert(key.clone(), value.clone());
            } else {
                stripped.insert(rest.to_string(), value.clone());
            }
        } else {
            plain.insert(key.clone(), value.clone());
        }
    }
    plain.extend(stripped);
    plain
}

/// A validated request to run one local task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRequest {
    #[serde(skip)]
    pub operation: Operation,
    #[serde(flatten)]
    pub keys: TaskKeys,
    pub task_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskRequest {
    /// Validate `fields` against the operation's tables
    pub fn build(
        operation: Operation,
        keys: TaskKeys,
        task_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        fields: Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        let task_name = task_name.into();
        debug!(%operation, %task_name, nfields = fields.len(), "TaskRequest::build: called");
        check_fields(operation.allowed(), operation.required(), &fields)?;
        Ok(Self {
            operation,
            keys,
            task_name,
            timestamp,
            fields,
        })
    }

    /// Keep only the fields the operation accepts, then validate
    pub fn from_packet_fields(
        operation: Operation,
        keys: TaskKeys,
        task_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        fields: &Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        Self::build(operation, keys, task_name, timestamp, project(operation.allowed(), fields))
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// A validated lookup query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupRequest {
    #[serde(skip)]
    pub kind: LookupKind,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LookupRequest {
    pub fn build(kind: LookupKind, fields: Map<String, Value>) -> Result<Self, ValidationError> {
        debug!(%kind, nfields = fields.len(), "LookupRequest::build: called");
        check_fields(kind.allowed(), kind.required(), &fields)?;
        Ok(Self { kind, fields })
    }

    pub fn from_packet_fields(kind: LookupKind, fields: &Map<String, Value>) -> Result<Self, ValidationError> {
        Self::build(kind, project(kind.allowed(), fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::fixtures::{at, keys};
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_build_lists_missing_and_disallowed() {
        let fields = map(json!({"ProjectID": "p1", "Bogus": 1, "Extra": "x"}));
        let err = TaskRequest::build(Operation::InactivateAccount, keys(), "inactivate_account", at(0), fields)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Fields {
                missing: vec!["PersonID".to_string(), "Resource".to_string()],
                disallowed: vec!["Bogus".to_string(), "Extra".to_string()],
            }
        );
    }

    #[test]
    fn test_any_of_rule() {
        let fields = map(json!({"Organization": "Analytical Engines"}));
        assert!(TaskRequest::build(Operation::ChooseOrAddOrg, keys(), "org", at(0), fields).is_ok());

        let err = TaskRequest::build(Operation::ChooseOrAddOrg, keys(), "org", at(0), Map::new()).unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["OrgCode|Organization".to_string()]));
    }

    #[test]
    fn test_empty_string_is_missing() {
        let fields = map(json!({"PersonID": ""}));
        let err = TaskRequest::build(Operation::ActivatePerson, keys(), "activate", at(0), fields).unwrap_err();
        assert!(matches!(err, ValidationError::MissingFields(_)));
    }

    #[test]
    fn test_from_packet_fields_projects() {
        let fields = map(json!({
            "PersonID": "u1",
            "ProjectID": "p1",
            "Resource": "cluster",
            "ResourceList": ["cluster"],
            "UserFirstName": "Ada",
        }));
        let req = TaskRequest::from_packet_fields(
            Operation::ReactivateAccount,
            keys(),
            "reactivate_account",
            at(0),
            &fields,
        )
        .unwrap();
        assert_eq!(req.fields.len(), 3);
        assert!(req.field("UserFirstName").is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let fields = map(json!({"PfosNumber": "12345"}));
        let req = TaskRequest::build(Operation::ChooseOrAddLocalFos, keys(), "local_fos", at(1), fields).unwrap();
        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["job_id"], "9001");
        assert_eq!(out["amie_transaction_id"], "X-ORIG:X-REMOTE:X-LOCAL:42");
        assert_eq!(out["task_name"], "local_fos");
        assert_eq!(out["timestamp"], 1_700_000_001_000i64);
        assert_eq!(out["PfosNumber"], "12345");
    }

    #[test]
    fn test_strip_role_prefix() {
        let fields = map(json!({
            "UserFirstName": "Ada",
            "Username": "ada",
            "user_person_id": "u1",
            "FirstName": "ignored",
            "GrantNumber": "TG-1",
            "PiLastName": "Hopper",
        }));
        let out = strip_role_prefix(Role::User, &fields);
        assert_eq!(out["FirstName"], "Ada");
        assert_eq!(out["Username"], "ada");
        assert_eq!(out["person_id"], "u1");
        assert_eq!(out["GrantNumber"], "TG-1");
        assert_eq!(out["PiLastName"], "Hopper");
        assert!(!out.contains_key("UserFirstName"));
    }

    #[test]
    fn test_lookup_project_name_base_any_of() {
        let fields = map(json!({
            "GrantNumber": "TG-1",
            "PfosNumber": "123",
            "PiOrganization": "Navy",
            "site_org": "NAVY",
            "site_grant_key": "g1",
            "ProjectTitle": "Compilers",
        }));
        assert!(LookupRequest::build(LookupKind::ProjectNameBase, fields).is_ok());
        assert!(LookupRequest::build(LookupKind::Org, Map::new()).is_err());
        assert!(LookupRequest::build(LookupKind::Person, Map::new()).is_ok());
    }

    #[test]
    fn test_lookup_project_task_needs_record_id() {
        let fields = map(json!({"RecordID": "r-17", "ProjectTitle": "Compilers", "PiLastName": "Hopper"}));
        let request = LookupRequest::from_packet_fields(LookupKind::ProjectTask, &fields).unwrap();
        assert_eq!(request.fields.len(), 1);
        assert_eq!(request.fields["RecordID"], "r-17");

        let err = LookupRequest::from_packet_fields(LookupKind::ProjectTask, &Map::new()).unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["RecordID".to_string()]));
    }

    #[test]
    fn test_reserved_update_person_identifiers_keeps_its_contract() {
        assert!(Operation::ALL.contains(&Operation::UpdatePersonIdentifiers));
        let fields = map(json!({"GlobalID": "g-1", "DnList": ["/C=US/CN=Grace Hopper"]}));
        let err = TaskRequest::build(Operation::UpdatePersonIdentifiers, keys(), "ids", at(0), fields).unwrap_err();
        assert_eq!(err, ValidationError::MissingFields(vec!["PersonID".to_string()]));
    }

    #[test]
    fn test_every_required_field_is_allowed() {
        for op in Operation::ALL {
            for rule in op.required() {
                let names: Vec<&str> = match rule {
                    FieldRule::One(n) => vec![*n],
                    FieldRule::AnyOf(ns) => ns.to_vec(),
                };
                for name in names {
                    assert!(op.allowed().contains(&name), "{} requires {} but does not allow it", op, name);
                }
            }
        }
    }
}
