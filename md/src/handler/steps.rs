//! Workflow steps shared by the packet handlers
//!
//! Each step resolves one value (or side effect) for a packet and caches it in
//! `ActionablePacket::resolved`. A step whose value is already cached returns
//! immediately without touching the local service. `Ok(Some(status))` means
//! the step's task is not finished yet and the handler must stop here.

use serde_json::{Map, Value};
use tracing::debug;

use super::adapter::ServiceProviderAdapter;
use crate::apacket::{ActionablePacket, ResolvedSteps};
use crate::error::ServiceError;
use crate::request::{LookupKind, Operation, Role};
use crate::task::{TaskState, TaskStatus, value_to_string};

/// Outcome of one step: `Some` carries the unfinished task
pub type StepResult = Result<Option<TaskStatus>, ServiceError>;

/// Extra request fields, skipping unresolved values
fn extra<const N: usize>(pairs: [(&str, Option<Value>); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect()
}

fn text(value: &Option<String>) -> Option<Value> {
    value.clone().map(Value::String)
}

/// Interpret flags the way the local service writes them
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "t" | "yes" | "y"),
        _ => false,
    }
}

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Scalar lookup results stand for the value itself; objects carry it under `key`
fn found_string(found: &Value, key: &str) -> Option<String> {
    match found {
        Value::Object(obj) => obj.get(key).and_then(value_to_string),
        scalar => value_to_string(scalar),
    }
    .filter(|s| !s.is_empty())
}

fn missing_product(status: &TaskStatus, product: &str) -> ServiceError {
    ServiceError::Internal(format!(
        "task '{}' succeeded without a {} product",
        status.task_name, product
    ))
}

/// A packet field as seen through a role, e.g. `PiPersonID` for `PersonID`
fn role_field(apacket: &ActionablePacket, role: Role, name: &str) -> Option<String> {
    apacket
        .field_string(&format!("{}{}", role.prefix(), name))
        .or_else(|| apacket.field_string(name))
}

fn done(status: &TaskStatus) -> bool {
    status.task_state == TaskState::Successful
}

pub async fn define_org_code(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket, role: Role) -> StepResult {
    if apacket.resolved.org_code.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), ?role, "define_org_code: called");

    let found = if adapter.has_task(apacket, Operation::ChooseOrAddOrg) {
        None
    } else {
        adapter.lookup(apacket, LookupKind::Org, Some(role), Map::new()).await?
    };
    let org_code = match found {
        Some(found) => found_string(&found, "OrgCode")
            .or_else(|| role_field(apacket, role, "OrgCode"))
            .ok_or_else(|| ServiceError::Internal("org lookup returned no OrgCode".to_string()))?,
        None => {
            let status = adapter
                .run_task(apacket, Operation::ChooseOrAddOrg, Some(role), Map::new())
                .await?;
            if !done(&status) {
                return Ok(Some(status));
            }
            status
                .product_string("OrgCode")
                .or_else(|| role_field(apacket, role, "OrgCode"))
                .ok_or_else(|| missing_product(&status, "OrgCode"))?
        }
    };
    debug!(%org_code, "define_org_code: resolved");
    apacket.resolved.org_code = Some(org_code);
    Ok(None)
}

pub async fn define_person(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket, role: Role) -> StepResult {
    if apacket.resolved.person_id.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), ?role, "define_person: called");

    let found = if adapter.has_task(apacket, Operation::ChooseOrAddPerson) {
        None
    } else {
        adapter.lookup(apacket, LookupKind::Person, Some(role), Map::new()).await?
    };
    let (person_id, login, site_org, active) = match found {
        Some(found) => (
            found_string(&found, "PersonID"),
            found.get("RemoteSiteLogin").and_then(value_to_string),
            found.get("site_org").and_then(value_to_string),
            found.get("active").is_some_and(truthy),
        ),
        None => {
            let status = adapter
                .run_task(apacket, Operation::ChooseOrAddPerson, Some(role), Map::new())
                .await?;
            if !done(&status) {
                return Ok(Some(status));
            }
            let person_id = status
                .product_string("PersonID")
                .ok_or_else(|| missing_product(&status, "PersonID"))?;
            (
                Some(person_id),
                status.product_string("RemoteSiteLogin"),
                status.product_string("site_org"),
                status.get_product_value("active").is_some_and(truthy),
            )
        }
    };

    let Some(person_id) = person_id else {
        return Err(ServiceError::Internal("person lookup returned no PersonID".to_string()));
    };
    debug!(%person_id, active, "define_person: resolved");
    let resolved = &mut apacket.resolved;
    resolved.person_id = Some(person_id);
    if login.is_some() {
        resolved.remote_site_login = login;
    }
    resolved.site_org = site_org;
    resolved.person_active = Some(active);
    Ok(None)
}

pub async fn activate_person(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket, role: Role) -> StepResult {
    if apacket.resolved.person_active == Some(true) {
        return Ok(None);
    }
    let person_id = apacket
        .resolved
        .person_id
        .clone()
        .or_else(|| role_field(apacket, role, "PersonID"));
    debug!(apacket = %apacket.name(), ?person_id, "activate_person: called");

    let fields = extra([("PersonID", person_id.map(Value::String))]);
    let status = adapter
        .run_task(apacket, Operation::ActivatePerson, Some(role), fields)
        .await?;
    if !done(&status) {
        return Ok(Some(status));
    }
    let active = status.get_product_value("active").is_none_or(truthy);
    apacket.resolved.person_active = Some(active);
    Ok(None)
}

pub async fn define_local_fos(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    if apacket.resolved.local_fos.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), "define_local_fos: called");

    let local_fos = if adapter.has_task(apacket, Operation::ChooseOrAddLocalFos) {
        None
    } else {
        adapter
            .lookup(apacket, LookupKind::LocalFos, None, Map::new())
            .await?
            .and_then(|found| found_string(&found, "areaOfInterest"))
    };
    let local_fos = match local_fos {
        Some(local_fos) => local_fos,
        None => {
            let status = adapter
                .run_task(apacket, Operation::ChooseOrAddLocalFos, None, Map::new())
                .await?;
            if !done(&status) {
                return Ok(Some(status));
            }
            status
                .product_string("areaOfInterest")
                .ok_or_else(|| missing_product(&status, "areaOfInterest"))?
        }
    };
    apacket.resolved.local_fos = Some(local_fos);
    Ok(None)
}

pub async fn define_site_grant_key(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    if apacket.resolved.site_grant_key.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), "define_site_grant_key: called");

    let key = if adapter.has_task(apacket, Operation::ChooseOrAddGrant) {
        None
    } else {
        adapter
            .lookup(apacket, LookupKind::Grant, None, Map::new())
            .await?
            .and_then(|found| found_string(&found, "site_grant_key"))
    };
    let key = match key {
        Some(key) => key,
        None => {
            let fields = extra([
                ("PiPersonID", text(&apacket.resolved.person_id)),
                ("local_fos", text(&apacket.resolved.local_fos)),
            ]);
            let status = adapter
                .run_task(apacket, Operation::ChooseOrAddGrant, None, fields)
                .await?;
            if !done(&status) {
                return Ok(Some(status));
            }
            status
                .product_string("site_grant_key")
                .ok_or_else(|| missing_product(&status, "site_grant_key"))?
        }
    };
    apacket.resolved.site_grant_key = Some(key);
    Ok(None)
}

pub async fn define_project_name_base(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    if apacket.resolved.project_name_base.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), "define_project_name_base: called");

    let fields = extra([
        ("site_grant_key", text(&apacket.resolved.site_grant_key)),
        ("site_org", text(&apacket.resolved.site_org)),
    ]);
    let base = if adapter.has_task(apacket, Operation::ChooseOrAddProjectNameBase) {
        None
    } else {
        adapter
            .lookup(apacket, LookupKind::ProjectNameBase, None, fields.clone())
            .await?
            .and_then(|found| found_string(&found, "project_name_base"))
    };
    let base = match base {
        Some(base) => base,
        None => {
            let status = adapter
                .run_task(apacket, Operation::ChooseOrAddProjectNameBase, None, fields)
                .await?;
            if !done(&status) {
                return Ok(Some(status));
            }
            status
                .product_string("project_name_base")
                .ok_or_else(|| missing_product(&status, "project_name_base"))?
        }
    };
    apacket.resolved.project_name_base = Some(base);
    Ok(None)
}

pub async fn define_project(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    if apacket.resolved.project_id.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), "define_project: called");

    let r = &apacket.resolved;
    let fields = extra([
        ("local_fos", text(&r.local_fos)),
        ("project_name_base", text(&r.project_name_base)),
        ("site_grant_key", text(&r.site_grant_key)),
        ("site_org", text(&r.site_org)),
        ("PiPersonID", text(&r.person_id)),
        ("RemoteSiteLogin", text(&r.remote_site_login)),
    ]);
    let status = adapter
        .run_task(apacket, Operation::CreateProject, None, fields)
        .await?;
    if !done(&status) {
        return Ok(Some(status));
    }

    let project_id = status
        .product_string("ProjectID")
        .ok_or_else(|| missing_product(&status, "ProjectID"))?;
    let resolved = &mut apacket.resolved;
    resolved.project_id = Some(project_id);
    resolved.service_units_allocated = status.get_product_value("ServiceUnitsAllocated").and_then(value_to_f64);
    resolved.start_date = status.product_string("StartDate");
    resolved.end_date = status.product_string("EndDate");
    if let Some(login) = status.product_string("PiRemoteSiteLogin") {
        resolved.remote_site_login = Some(login);
    }
    Ok(None)
}

/// Reply data for a project the local service has already provisioned
///
/// Only requests carrying a `RecordID` are looked up, and only before any
/// task has run for the job. Returns true when `resolved` holds the project.
pub async fn lookup_project_task(
    adapter: &ServiceProviderAdapter,
    apacket: &mut ActionablePacket,
) -> Result<bool, ServiceError> {
    if apacket.resolved.project_id.is_some() || apacket.field("RecordID").is_none() || !apacket.tasks().is_empty() {
        return Ok(false);
    }
    debug!(apacket = %apacket.name(), "lookup_project_task: called");

    let Some(found) = adapter
        .lookup(apacket, LookupKind::ProjectTask, None, Map::new())
        .await?
    else {
        return Ok(false);
    };
    let project_id = found_string(&found, "ProjectID")
        .ok_or_else(|| ServiceError::Internal("project task lookup returned no ProjectID".to_string()))?;
    debug!(%project_id, "lookup_project_task: found");

    let string = |key: &str| found.get(key).and_then(value_to_string);
    let resolved = &mut apacket.resolved;
    resolved.project_id = Some(project_id);
    if let Some(person_id) = string("PiPersonID") {
        resolved.person_id = Some(person_id);
    }
    if let Some(login) = string("PiRemoteSiteLogin") {
        resolved.remote_site_login = Some(login);
    }
    resolved.service_units_allocated = found.get("ServiceUnitsAllocated").and_then(value_to_f64);
    resolved.start_date = string("StartDate");
    resolved.end_date = string("EndDate");
    Ok(true)
}

pub async fn define_account(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    if apacket.resolved.account_login.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), "define_account: called");

    let fields = extra([
        ("PersonID", text(&apacket.resolved.person_id)),
        ("ProjectID", text(&apacket.resolved.project_id)),
    ]);
    let status = adapter
        .run_task(apacket, Operation::CreateAccount, None, fields)
        .await?;
    if !done(&status) {
        return Ok(Some(status));
    }

    let login = status
        .product_string("RemoteSiteLogin")
        .or_else(|| apacket.resolved.remote_site_login.clone())
        .unwrap_or_default();
    let project_id = status
        .product_string("ProjectID")
        .or_else(|| apacket.field_string("ProjectID"));
    let resolved = &mut apacket.resolved;
    resolved.account_login = Some(login);
    resolved.account_activity_time = status.product_string("AccountActivityTime");
    if project_id.is_some() {
        resolved.project_id = project_id;
    }
    Ok(None)
}

pub async fn define_allocation(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    if apacket.resolved.service_units_allocated.is_some() {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), "define_allocation: called");

    let fields = extra([("ProjectID", text(&apacket.resolved.project_id))]);
    let status = adapter
        .run_task(apacket, Operation::UpdateAllocation, None, fields)
        .await?;
    if !done(&status) {
        return Ok(Some(status));
    }

    let units = status
        .get_product_value("ServiceUnitsAllocated")
        .and_then(value_to_f64)
        .or_else(|| apacket.field("ServiceUnitsAllocated").and_then(value_to_f64))
        .ok_or_else(|| missing_product(&status, "ServiceUnitsAllocated"))?;
    let resolved = &mut apacket.resolved;
    resolved.service_units_allocated = Some(units);
    resolved.start_date = status.product_string("StartDate");
    resolved.end_date = status.product_string("EndDate");
    resolved.resource_name = status.product_string("resource_name");
    Ok(None)
}

pub async fn notify_user(adapter: &ServiceProviderAdapter, apacket: &mut ActionablePacket) -> StepResult {
    let r = &apacket.resolved;
    let login = r.account_login.clone().filter(|l| !l.is_empty()).or_else(|| r.remote_site_login.clone());
    let fields = extra([
        ("project_id", text(&r.project_id)),
        ("person_id", text(&r.person_id)),
        ("RemoteSiteLogin", login.map(Value::String)),
        ("resource_name", text(&r.resource_name)),
    ]);
    run_flagged(adapter, apacket, Operation::NotifyUser, None, fields, |r| &mut r.user_notified).await
}

/// Run a task whose only result is that it happened
///
/// `flag` selects the `ResolvedSteps` field recording completion.
pub async fn run_flagged(
    adapter: &ServiceProviderAdapter,
    apacket: &mut ActionablePacket,
    operation: Operation,
    role: Option<Role>,
    fields: Map<String, Value>,
    flag: fn(&mut ResolvedSteps) -> &mut Option<bool>,
) -> StepResult {
    if *flag(&mut apacket.resolved) == Some(true) {
        return Ok(None);
    }
    debug!(apacket = %apacket.name(), %operation, "run_flagged: called");

    let status = adapter.run_task(apacket, operation, role, fields).await?;
    if !done(&status) {
        return Ok(Some(status));
    }
    *flag(&mut apacket.resolved) = Some(true);
    Ok(None)
}

pub async fn clear_transaction(
    adapter: &ServiceProviderAdapter,
    apacket: &mut ActionablePacket,
) -> Result<(), ServiceError> {
    if apacket.resolved.transaction_cleared == Some(true) {
        return Ok(());
    }
    adapter.clear_transaction(apacket).await?;
    apacket.resolved.transaction_cleared = Some(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::adapter;
    use crate::packet::fixtures::{account_create, project_create};
    use crate::provider::mock::ScriptedLocalService;
    use crate::task::Product;
    use chrono::TimeDelta;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("Yes")));
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!("0")));
        assert!(!truthy(&json!(null)));
    }

    #[tokio::test]
    async fn test_org_code_from_lookup() {
        let local = Arc::new(ScriptedLocalService::new());
        local.set_lookup(LookupKind::Org, json!({"OrgCode": "0012345", "Name": "AE"}));
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(account_create(1, 2), None).unwrap();

        assert!(define_org_code(&adapter, &mut ap, Role::User).await.unwrap().is_none());
        assert_eq!(ap.resolved.org_code.as_deref(), Some("0012345"));
        assert_eq!(local.submit_count(), 0);

        define_org_code(&adapter, &mut ap, Role::User).await.unwrap();
        assert_eq!(local.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_task_skips_lookup_on_reentry() {
        let local = Arc::new(ScriptedLocalService::new());
        local.script(Operation::ChooseOrAddOrg, TaskState::Queued, vec![]);
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(account_create(1, 2), None).unwrap();

        assert!(define_org_code(&adapter, &mut ap, Role::User).await.unwrap().is_some());
        assert!(define_org_code(&adapter, &mut ap, Role::User).await.unwrap().is_some());
        assert_eq!(local.lookup_count(), 1);
        assert_eq!(local.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_person_from_task_products() {
        let local = Arc::new(ScriptedLocalService::new());
        local.script(
            Operation::ChooseOrAddPerson,
            TaskState::Successful,
            vec![
                Product::new("PersonID", "u-100"),
                Product::new("RemoteSiteLogin", "ada"),
                Product::new("site_org", "AE"),
                Product::new("active", "0"),
            ],
        );
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(account_create(1, 2), None).unwrap();

        assert!(define_person(&adapter, &mut ap, Role::User).await.unwrap().is_none());
        assert_eq!(ap.resolved.person_id.as_deref(), Some("u-100"));
        assert_eq!(ap.resolved.remote_site_login.as_deref(), Some("ada"));
        assert_eq!(ap.resolved.person_active, Some(false));
    }

    #[tokio::test]
    async fn test_pending_step_returns_status() {
        let local = Arc::new(ScriptedLocalService::new());
        local.script(Operation::ChooseOrAddLocalFos, TaskState::InProgress, vec![]);
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(project_create(1, 2, "new"), None).unwrap();

        let pending = define_local_fos(&adapter, &mut ap).await.unwrap().unwrap();
        assert_eq!(pending.task_state, TaskState::InProgress);
        assert!(ap.resolved.local_fos.is_none());
    }

    #[tokio::test]
    async fn test_project_products_cached() {
        let local = Arc::new(ScriptedLocalService::new());
        local.script(
            Operation::CreateProject,
            TaskState::Successful,
            vec![
                Product::new("ProjectID", "p-new"),
                Product::new("ServiceUnitsAllocated", "50000"),
                Product::new("StartDate", "2024-01-01"),
                Product::new("EndDate", "2025-01-01"),
                Product::new("PiRemoteSiteLogin", "grace"),
            ],
        );
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(project_create(1, 2, "new"), None).unwrap();
        ap.resolved.local_fos = Some("Computer Science".to_string());
        ap.resolved.project_name_base = Some("cs".to_string());
        ap.resolved.site_grant_key = Some("g-1".to_string());
        ap.resolved.person_id = Some("u-1".to_string());
        ap.resolved.remote_site_login = Some("ghopper".to_string());

        assert!(define_project(&adapter, &mut ap).await.unwrap().is_none());
        assert_eq!(ap.resolved.project_id.as_deref(), Some("p-new"));
        assert_eq!(ap.resolved.service_units_allocated, Some(50000.0));
        assert_eq!(ap.resolved.remote_site_login.as_deref(), Some("grace"));

        let request = local.last_request(Operation::CreateProject).unwrap();
        assert_eq!(request.field("RemoteSiteLogin"), Some(&json!("ghopper")));
        assert_eq!(request.field("PiPersonID"), Some(&json!("u-1")));
    }

    #[tokio::test]
    async fn test_success_without_required_product_is_internal() {
        let local = Arc::new(ScriptedLocalService::new());
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(project_create(1, 2, "new"), None).unwrap();

        let err = define_local_fos(&adapter, &mut ap).await.unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
    }

    #[tokio::test]
    async fn test_org_task_without_org_code_is_internal() {
        let local = Arc::new(ScriptedLocalService::new());
        let adapter = adapter(&local);
        let mut packet = account_create(1, 2);
        packet.body.remove("UserOrgCode");
        let mut ap = ActionablePacket::new(packet, None).unwrap();
        let finished = TaskStatus::new(
            ap.task_keys(),
            "choose_or_add_org",
            Some(TaskState::Successful),
            ap.timestamp() + TimeDelta::seconds(1),
            vec![],
        )
        .unwrap();
        ap.add_or_update_task(finished);

        let err = define_org_code(&adapter, &mut ap, Role::User).await.unwrap_err();
        assert!(matches!(err, ServiceError::Internal(msg) if msg.contains("OrgCode")));
        assert!(ap.resolved.org_code.is_none());
        assert_eq!(local.lookup_count(), 0);
        assert_eq!(local.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_project_task_lookup_needs_record_id() {
        let local = Arc::new(ScriptedLocalService::new());
        local.set_lookup(LookupKind::ProjectTask, json!({"ProjectID": "p-old"}));
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(project_create(1, 2, "new"), None).unwrap();

        assert!(!lookup_project_task(&adapter, &mut ap).await.unwrap());
        assert_eq!(local.lookup_count(), 0);
        assert!(ap.resolved.project_id.is_none());
    }

    #[tokio::test]
    async fn test_clear_transaction_once() {
        let local = Arc::new(ScriptedLocalService::new());
        let adapter = adapter(&local);
        let mut ap = ActionablePacket::new(account_create(1, 2), None).unwrap();

        clear_transaction(&adapter, &mut ap).await.unwrap();
        clear_transaction(&adapter, &mut ap).await.unwrap();
        assert_eq!(local.clear_count(), 1);
    }
}
