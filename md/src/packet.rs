//! AMIE packet model
//!
//! Packets are the messages exchanged with the remote service. This module
//! covers the wire shape, the per-type protocol tables (expected reply and
//! required body fields), and construction of same-transaction replies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ValidationError;

/// Offset added to a received packet_id when building our reply
///
/// The remote site allocates packet ids for its own packets; adding a large
/// offset keeps ours distinct within the same transaction.
pub const REPLY_PACKET_ID_OFFSET: i64 = 1000;

/// Composite key of an AMIE transaction
///
/// Rendered as `originating:remote:local:transaction_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId {
    pub originating_site: String,
    pub remote_site: String,
    pub local_site: String,
    pub transaction_id: String,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.originating_site, self.remote_site, self.local_site, self.transaction_id
        )
    }
}

impl FromStr for TransactionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(ValidationError::Invalid(format!("Malformed transaction id: {}", s)));
        }
        Ok(Self {
            originating_site: parts[0].to_string(),
            remote_site: parts[1].to_string(),
            local_site: parts[2].to_string(),
            transaction_id: parts[3].to_string(),
        })
    }
}

impl TryFrom<String> for TransactionId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TransactionId> for String {
    fn from(id: TransactionId) -> Self {
        id.to_string()
    }
}

/// Known AMIE packet types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PacketType {
    RequestAccountCreate,
    NotifyAccountCreate,
    DataAccountCreate,
    RequestProjectCreate,
    NotifyProjectCreate,
    DataProjectCreate,
    RequestAccountInactivate,
    NotifyAccountInactivate,
    RequestAccountReactivate,
    NotifyAccountReactivate,
    RequestProjectInactivate,
    NotifyProjectInactivate,
    RequestProjectReactivate,
    NotifyProjectReactivate,
    RequestUserModify,
    RequestPersonMerge,
    InformTransactionComplete,
    Other(String),
}

const NAMED_TYPES: &[(&str, PacketType)] = &[
    ("request_account_create", PacketType::RequestAccountCreate),
    ("notify_account_create", PacketType::NotifyAccountCreate),
    ("data_account_create", PacketType::DataAccountCreate),
    ("request_project_create", PacketType::RequestProjectCreate),
    ("notify_project_create", PacketType::NotifyProjectCreate),
    ("data_project_create", PacketType::DataProjectCreate),
    ("request_account_inactivate", PacketType::RequestAccountInactivate),
    ("notify_account_inactivate", PacketType::NotifyAccountInactivate),
    ("request_account_reactivate", PacketType::RequestAccountReactivate),
    ("notify_account_reactivate", PacketType::NotifyAccountReactivate),
    ("request_project_inactivate", PacketType::RequestProjectInactivate),
    ("notify_project_inactivate", PacketType::NotifyProjectInactivate),
    ("request_project_reactivate", PacketType::RequestProjectReactivate),
    ("notify_project_reactivate", PacketType::NotifyProjectReactivate),
    ("request_user_modify", PacketType::RequestUserModify),
    ("request_person_merge", PacketType::RequestPersonMerge),
    ("inform_transaction_complete", PacketType::InformTransactionComplete),
];

impl PacketType {
    pub fn as_str(&self) -> &str {
        match self {
            PacketType::Other(name) => name,
            known => NAMED_TYPES
                .iter()
                .find(|(_, t)| t == known)
                .map(|(name, _)| *name)
                .unwrap_or("unknown"),
        }
    }

    pub fn is_itc(&self) -> bool {
        *self == PacketType::InformTransactionComplete
    }

    /// Packet types the protocol allows in reply to this one
    pub fn expected_reply(&self) -> Vec<PacketType> {
        use PacketType::*;
        match self {
            RequestAccountCreate => vec![NotifyAccountCreate],
            NotifyAccountCreate => vec![DataAccountCreate],
            RequestProjectCreate => vec![NotifyProjectCreate],
            NotifyProjectCreate => vec![DataProjectCreate],
            RequestAccountInactivate => vec![NotifyAccountInactivate],
            RequestAccountReactivate => vec![NotifyAccountReactivate],
            RequestProjectInactivate => vec![NotifyProjectInactivate],
            RequestProjectReactivate => vec![NotifyProjectReactivate],
            DataAccountCreate
            | DataProjectCreate
            | NotifyAccountInactivate
            | NotifyAccountReactivate
            | NotifyProjectInactivate
            | NotifyProjectReactivate
            | RequestUserModify
            | RequestPersonMerge => vec![InformTransactionComplete],
            InformTransactionComplete | Other(_) => vec![],
        }
    }

    /// Body fields that must be present for a packet of this type
    pub fn required_fields(&self) -> &'static [&'static str] {
        use PacketType::*;
        match self {
            RequestAccountCreate => &[
                "GrantNumber",
                "ResourceList",
                "UserFirstName",
                "UserLastName",
                "UserOrganization",
                "UserOrgCode",
            ],
            RequestProjectCreate => &[
                "AllocationType",
                "GrantNumber",
                "PfosNumber",
                "PiFirstName",
                "PiLastName",
                "PiOrganization",
                "PiOrgCode",
                "ProjectTitle",
                "ResourceList",
                "ServiceUnitsAllocated",
                "StartDate",
                "EndDate",
            ],
            DataAccountCreate | DataProjectCreate => &["PersonID", "ProjectID"],
            RequestAccountInactivate | RequestAccountReactivate => &["PersonID", "ProjectID", "ResourceList"],
            RequestProjectInactivate | RequestProjectReactivate => &["ProjectID", "ResourceList"],
            RequestUserModify => &["ActionType", "PersonID"],
            RequestPersonMerge => &["KeepGlobalID", "KeepPersonID", "DeleteGlobalID", "DeletePersonID"],
            InformTransactionComplete => &["StatusCode", "DetailCode", "Message"],
            _ => &[],
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for PacketType {
    fn from(s: String) -> Self {
        NAMED_TYPES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, t)| t.clone())
            .unwrap_or(PacketType::Other(s))
    }
}

impl From<&str> for PacketType {
    fn from(s: &str) -> Self {
        PacketType::from(s.to_string())
    }
}

impl From<PacketType> for String {
    fn from(t: PacketType) -> Self {
        t.as_str().to_string()
    }
}

/// Packet header as exchanged with the remote service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PacketHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_rec_id: Option<i64>,
    pub packet_id: i64,
    pub transaction_id: i64,
    pub originating_site_name: String,
    pub remote_site_name: String,
    pub local_site_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<i64>,
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    pub header: PacketHeader,
    #[serde(default)]
    pub body: Map<String, Value>,
}

impl Packet {
    pub fn new(packet_type: PacketType, header: PacketHeader) -> Self {
        Self {
            packet_type,
            header,
            body: Map::new(),
        }
    }

    pub fn transaction_key(&self) -> TransactionId {
        TransactionId {
            originating_site: self.header.originating_site_name.clone(),
            remote_site: self.header.remote_site_name.clone(),
            local_site: self.header.local_site_name.clone(),
            transaction_id: self.header.transaction_id.to_string(),
        }
    }

    /// Job id for tasks serving this packet: the remote record id
    pub fn job_id(&self) -> Option<String> {
        self.header.packet_rec_id.map(|id| id.to_string())
    }

    pub fn packet_id(&self) -> String {
        self.header.packet_id.to_string()
    }

    /// `type:transaction:packet_id`, for logs
    pub fn label(&self) -> String {
        format!("{}:{}:{}", self.packet_type, self.transaction_key(), self.header.packet_id)
    }

    pub fn is_addressed_to(&self, site_name: &str) -> bool {
        self.header.remote_site_name == site_name
    }

    pub fn expects_reply(&self) -> bool {
        !self.packet_type.expected_reply().is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.body.get(name).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.body.insert(name.to_string(), value.into());
    }

    /// Same site triple, transaction, record and type
    pub fn same_identity(&self, other: &Packet) -> bool {
        self.header.originating_site_name == other.header.originating_site_name
            && self.header.local_site_name == other.header.local_site_name
            && self.header.remote_site_name == other.header.remote_site_name
            && self.header.transaction_id == other.header.transaction_id
            && self.header.packet_rec_id == other.header.packet_rec_id
            && self.packet_type == other.packet_type
    }

    /// True if this is the remote service's copy of a packet we sent
    pub fn is_echo_of(&self, sent: &Packet) -> bool {
        self.packet_type == sent.packet_type
            && self.header.originating_site_name == sent.header.originating_site_name
            && self.header.transaction_id == sent.header.transaction_id
            && self.header.packet_id == sent.header.packet_id
    }

    /// Names of required header and body fields that are absent
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.header.packet_rec_id.is_none() {
            missing.push("packet_rec_id".to_string());
        }
        for name in self.packet_type.required_fields() {
            let present = match self.body.get(*name) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(_) => true,
            };
            if !present {
                missing.push(name.to_string());
            }
        }
        missing
    }

    /// Check that an incoming packet carries everything its type requires
    pub fn validate(&self) -> Result<(), ValidationError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            debug!(packet = %self.label(), ?missing, "Packet::validate: missing fields");
            Err(ValidationError::Invalid(format!(
                "Required attributes are missing from incoming packet: {}",
                missing.join(",")
            )))
        }
    }

    fn reply_header(&self) -> PacketHeader {
        PacketHeader {
            packet_rec_id: None,
            packet_id: self.header.packet_id + REPLY_PACKET_ID_OFFSET,
            transaction_id: self.header.transaction_id,
            originating_site_name: self.header.originating_site_name.clone(),
            remote_site_name: self.header.remote_site_name.clone(),
            local_site_name: self.header.local_site_name.clone(),
            packet_timestamp: None,
            packet_state: None,
            in_reply_to: self.header.packet_rec_id,
        }
    }

    /// Build the protocol-defined reply to this packet
    ///
    /// Types without a declared reply are answered with a success ITC.
    pub fn reply_packet(&self) -> Packet {
        let reply_type = self
            .packet_type
            .expected_reply()
            .into_iter()
            .next()
            .unwrap_or(PacketType::InformTransactionComplete);
        debug!(packet = %self.label(), %reply_type, "Packet::reply_packet: called");
        let mut reply = Packet::new(reply_type, self.reply_header());
        if reply.packet_type.is_itc() {
            reply.set("StatusCode", "Success");
            reply.set("DetailCode", 1);
            reply.set("Message", "Success");
        }
        reply
    }

    /// Build an ITC that reports failure of this packet's request
    pub fn reply_with_failure(&self, message: &str) -> Packet {
        debug!(packet = %self.label(), %message, "Packet::reply_with_failure: called");
        let mut reply = Packet::new(PacketType::InformTransactionComplete, self.reply_header());
        reply.set("StatusCode", "Failed");
        reply.set("DetailCode", 2);
        reply.set("Message", message);
        reply
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    pub const SITE: &str = "X-LOCAL";

    pub fn header(rec_id: i64, packet_id: i64, transaction_id: i64) -> PacketHeader {
        PacketHeader {
            packet_rec_id: Some(rec_id),
            packet_id,
            transaction_id,
            originating_site_name: "X-ORIG".to_string(),
            remote_site_name: SITE.to_string(),
            local_site_name: "X-REMOTE".to_string(),
            packet_timestamp: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            packet_state: Some("incomplete".to_string()),
            in_reply_to: None,
        }
    }

    pub fn account_create(rec_id: i64, transaction_id: i64) -> Packet {
        let mut packet = Packet::new(PacketType::RequestAccountCreate, header(rec_id, 5, transaction_id));
        packet.set("GrantNumber", "TG-ABC123");
        packet.set("ProjectID", "p-abc123");
        packet.set("ResourceList", json!(["cluster.site.org"]));
        packet.set("UserFirstName", "Ada");
        packet.set("UserLastName", "Lovelace");
        packet.set("UserOrganization", "Analytical Engines");
        packet.set("UserOrgCode", "0012345");
        packet.set("UserPersonID", "amie-77");
        packet
    }

    pub fn project_create(rec_id: i64, transaction_id: i64, allocation_type: &str) -> Packet {
        let mut packet = Packet::new(PacketType::RequestProjectCreate, header(rec_id, 1, transaction_id));
        packet.set("AllocationType", allocation_type);
        packet.set("GrantNumber", "TG-XYZ789");
        packet.set("PfosNumber", "12345");
        packet.set("PiFirstName", "Grace");
        packet.set("PiLastName", "Hopper");
        packet.set("PiOrganization", "Navy");
        packet.set("PiOrgCode", "0099999");
        packet.set("PiPersonID", "amie-1");
        packet.set("ProjectTitle", "Compilers");
        packet.set("ResourceList", json!(["cluster.site.org"]));
        packet.set("ServiceUnitsAllocated", 50000.0);
        packet.set("StartDate", "2024-01-01T00:00:00Z");
        packet.set("EndDate", "2025-01-01T00:00:00Z");
        packet
    }
}
