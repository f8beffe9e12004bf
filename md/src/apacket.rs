//! ActionablePacket: a packet plus the local work done on its behalf
//!
//! An `ActionablePacket` is the unit a packet handler works on. It holds the
//! received packet, a flattened view of its body, the job's task list, and
//! `ResolvedSteps`, where handlers cache each workflow step's output so that
//! re-entering `work()` skips everything already resolved.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::ValidationError;
use crate::packet::{Packet, PacketType, TransactionId};
use crate::task::{TaskKeys, TaskStatus, TaskStatusList, value_to_string};

/// Outputs of workflow steps, filled in as steps complete
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedSteps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_site_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_fos: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_grant_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_units_allocated: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_activity_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_notified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_modified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_merged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_inactivated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_reactivated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_inactivated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_reactivated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_cleared: Option<bool>,
}

/// A received packet merged with its local task state
#[derive(Debug, Clone)]
pub struct ActionablePacket {
    packet: Packet,
    job_id: String,
    transaction_id: TransactionId,
    packet_id: String,
    packet_timestamp: DateTime<Utc>,
    timestamp: DateTime<Utc>,
    tasks: TaskStatusList,
    fields: Map<String, Value>,
    pub resolved: ResolvedSteps,
}

impl ActionablePacket {
    /// Build from a packet and any tasks already known for its job
    pub fn new(packet: Packet, tasks: Option<TaskStatusList>) -> Result<Self, ValidationError> {
        let job_id = packet
            .job_id()
            .ok_or_else(|| ValidationError::MissingFields(vec!["packet_rec_id".to_string()]))?;
        let transaction_id = packet.transaction_key();
        let packet_id = packet.packet_id();
        let packet_timestamp = packet.header.packet_timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        debug!(%job_id, %transaction_id, %packet_id, "ActionablePacket::new: called");

        let mut fields = packet.body.clone();
        // ResourceList always carries a single resource
        if let Some(resources) = fields.get("ResourceList").and_then(Value::as_array) {
            let first = resources.first().cloned().unwrap_or(Value::Null);
            fields.insert("Resource".to_string(), first);
        }

        let tasks = tasks.unwrap_or_default();
        let timestamp = tasks
            .latest_timestamp()
            .map_or(packet_timestamp, |t| t.max(packet_timestamp));

        Ok(Self {
            packet,
            job_id,
            transaction_id,
            packet_id,
            packet_timestamp,
            timestamp,
            tasks,
            fields,
            resolved: ResolvedSteps::default(),
        })
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_type(&self) -> &PacketType {
        &self.packet.packet_type
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn packet_id(&self) -> &str {
        &self.packet_id
    }

    pub fn packet_timestamp(&self) -> DateTime<Utc> {
        self.packet_timestamp
    }

    /// Latest of the packet timestamp and any task timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tasks(&self) -> &TaskStatusList {
        &self.tasks
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Body field, ignoring nulls
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn field_string(&self, name: &str) -> Option<String> {
        self.field(name).and_then(value_to_string).filter(|s| !s.is_empty())
    }

    /// `type.transaction_id.packet_id`
    pub fn name(&self) -> String {
        format!("{}.{}.{}", self.packet.packet_type, self.transaction_id, self.packet_id)
    }

    /// Keys a new task for this packet should carry
    pub fn task_keys(&self) -> TaskKeys {
        TaskKeys {
            job_id: self.job_id.clone(),
            transaction_id: self.transaction_id.clone(),
            packet_id: self.packet_id.clone(),
            packet_type: self.packet.packet_type.to_string(),
        }
    }

    fn advance_timestamp(&mut self, candidate: DateTime<Utc>) {
        if candidate > self.timestamp {
            self.timestamp = candidate;
        }
    }

    /// Merge a re-delivered packet and task updates
    pub fn update(&mut self, packet: &Packet, tasks: Option<&TaskStatusList>) -> bool {
        let mut changed = false;
        if let Some(tasks) = tasks {
            for task in tasks.iter() {
                changed |= self.add_or_update_task(task.clone());
            }
        }
        if let Some(ts) = packet.header.packet_timestamp {
            self.advance_timestamp(ts);
        }
        changed
    }

    /// Merge one task update; returns true if the task list changed
    pub fn add_or_update_task(&mut self, status: TaskStatus) -> bool {
        let ts = status.timestamp;
        let changed = self.tasks.put(status);
        if changed {
            self.advance_timestamp(ts);
        }
        changed
    }

    pub fn find_active_task(&self) -> Option<&TaskStatus> {
        self.tasks.find_active_task()
    }

    pub fn create_reply_packet(&self) -> Packet {
        self.packet.reply_packet()
    }

    pub fn create_failure_reply_packet(&self, message: &str) -> Packet {
        self.packet.reply_with_failure(message)
    }

    /// Full record for the monitoring snapshot
    pub fn snapshot_record(&self) -> Map<String, Value> {
        let mut record = self.fields.clone();
        if let Ok(Value::Object(resolved)) = serde_json::to_value(&self.resolved) {
            record.extend(resolved);
        }
        record.insert("job_id".to_string(), json!(self.job_id));
        record.insert("packet_type".to_string(), json!(self.packet.packet_type.to_string()));
        record.insert(
            "amie_packet_timestamp".to_string(),
            json!(self.packet_timestamp.to_rfc3339()),
        );
        record.insert("amie_transaction_id".to_string(), json!(self.transaction_id.to_string()));
        record.insert("amie_packet_rec_id".to_string(), json!(self.job_id));
        record.insert("amie_packet_id".to_string(), json!(self.packet_id));
        record.insert("timestamp".to_string(), json!(self.timestamp.to_rfc3339()));
        let tasks: Vec<Value> = self
            .tasks
            .get_list()
            .into_iter()
            .map(|t| {
                json!({
                    "task_name": t.task_name,
                    "task_state": t.task_state,
                    "timestamp": t.timestamp.to_rfc3339(),
                    "products": t.products,
                })
            })
            .collect();
        record.insert("tasks".to_string(), Value::Array(tasks));
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::fixtures::{account_create, header};
    use crate::packet::REPLY_PACKET_ID_OFFSET;
    use crate::task::TaskState;
    use chrono::TimeDelta;

    fn task_for(apacket: &ActionablePacket, name: &str, state: TaskState, offset: i64) -> TaskStatus {
        TaskStatus::new(
            apacket.task_keys(),
            name,
            Some(state),
            apacket.packet_timestamp() + TimeDelta::seconds(offset),
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_new_derives_keys() {
        let apacket = ActionablePacket::new(account_create(9001, 42), None).unwrap();
        assert_eq!(apacket.job_id(), "9001");
        assert_eq!(apacket.packet_id(), "5");
        assert_eq!(apacket.transaction_id().to_string(), "X-ORIG:X-LOCAL:X-REMOTE:42");
        assert_eq!(apacket.field_string("Resource").as_deref(), Some("cluster.site.org"));
        assert_eq!(apacket.timestamp(), apacket.packet_timestamp());
        assert_eq!(apacket.name(), "request_account_create.X-ORIG:X-LOCAL:X-REMOTE:42.5");
    }

    #[test]
    fn test_new_requires_record_id() {
        let mut packet = account_create(1, 2);
        packet.header.packet_rec_id = None;
        assert!(ActionablePacket::new(packet, None).is_err());
    }

    #[test]
    fn test_timestamp_never_regresses() {
        let mut apacket = ActionablePacket::new(account_create(1, 2), None).unwrap();
        let start = apacket.timestamp();

        let later = task_for(&apacket, "choose_or_add_org", TaskState::Queued, 30);
        assert!(apacket.add_or_update_task(later));
        assert_eq!(apacket.timestamp(), start + TimeDelta::seconds(30));

        let earlier = task_for(&apacket, "notify_user", TaskState::Queued, 5);
        assert!(apacket.add_or_update_task(earlier));
        assert_eq!(apacket.timestamp(), start + TimeDelta::seconds(30));

        let packet = apacket.packet().clone();
        apacket.update(&packet, None);
        assert_eq!(apacket.timestamp(), start + TimeDelta::seconds(30));
    }

    #[test]
    fn test_update_merges_tasks() {
        let mut apacket = ActionablePacket::new(account_create(1, 2), None).unwrap();
        let tasks: TaskStatusList = vec![task_for(&apacket, "create_account", TaskState::InProgress, 10)]
            .into_iter()
            .collect();
        let packet = apacket.packet().clone();
        assert!(apacket.update(&packet, Some(&tasks)));
        assert_eq!(apacket.find_active_task().unwrap().task_name, "create_account");
        assert!(!apacket.update(&packet, Some(&tasks)));
    }

    #[test]
    fn test_reply_identity() {
        let apacket = ActionablePacket::new(account_create(1, 2), None).unwrap();
        let reply = apacket.create_reply_packet();
        assert_eq!(reply.transaction_key(), *apacket.transaction_id());
        assert_eq!(reply.header.packet_id, 5 + REPLY_PACKET_ID_OFFSET);

        let failure = apacket.create_failure_reply_packet("nope");
        assert!(failure.packet_type.is_itc());
    }

    #[test]
    fn test_snapshot_record_has_fixed_keys() {
        let mut apacket = ActionablePacket::new(account_create(1, 2), None).unwrap();
        apacket.resolved.org_code = Some("0012345".to_string());
        let record = apacket.snapshot_record();
        for key in ["job_id", "packet_type", "amie_transaction_id", "timestamp", "tasks"] {
            assert!(record.contains_key(key), "missing {}", key);
        }
        assert_eq!(record["org_code"], json!("0012345"));
        assert!(!record.contains_key("person_id"));
    }

    #[test]
    fn test_empty_resource_list() {
        let mut packet = crate::packet::Packet::new(PacketType::RequestProjectInactivate, header(1, 1, 1));
        packet.set("ResourceList", json!([]));
        let apacket = ActionablePacket::new(packet, None).unwrap();
        assert!(apacket.field("Resource").is_none());
    }
}
