//! Drives packet handlers and keeps the monitoring snapshots current
//!
//! The PacketManager runs `work()` on every actionable packet, turns handler
//! outcomes into replies or "still waiting", and decides from the buffered
//! task states how soon local task updates are likely.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::apacket::ActionablePacket;
use crate::error::{MediatorError, MediatorResult, ServiceError};
use crate::handler::{HandlerRegistry, ServiceProviderAdapter, WorkOutcome};
use crate::packet::{Packet, TransactionId};
use crate::snapshot::SnapshotStore;
use crate::task::{TaskState, TaskStatus};
use crate::timing::DelayClass;
use crate::transaction::TransactionManager;

/// Snapshot keys written on every partial update
const FIXED_SNAPSHOT_KEYS: &[&str] = &[
    "job_id",
    "packet_type",
    "amie_packet_timestamp",
    "amie_transaction_id",
    "amie_packet_rec_id",
    "amie_packet_id",
    "timestamp",
    "tasks",
];

/// What the buffered task states say about upcoming local task updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskExpectation {
    /// Some task is being worked on right now
    pub busy: bool,
    /// Some task has not finished
    pub pending: bool,
}

impl TaskExpectation {
    pub fn from_tasks<'a, I: IntoIterator<Item = &'a TaskStatus>>(tasks: I) -> Self {
        let mut expectation = Self::default();
        for task in tasks {
            if task.task_state.is_busy() {
                expectation.busy = true;
                expectation.pending = true;
            } else if task.task_state.is_waiting() {
                expectation.pending = true;
            }
        }
        expectation
    }

    pub fn delay_class(self) -> DelayClass {
        if self.busy {
            DelayClass::ImminentAutoReply
        } else if self.pending {
            DelayClass::HumanActionPending
        } else {
            DelayClass::Idle
        }
    }
}

pub struct PacketManager {
    handlers: HandlerRegistry,
    adapter: ServiceProviderAdapter,
    snapshots: Box<dyn SnapshotStore>,
    /// First full snapshot per key, with its transaction
    initial: HashMap<String, (TransactionId, Map<String, Value>)>,
}

impl PacketManager {
    pub fn new(handlers: HandlerRegistry, adapter: ServiceProviderAdapter, snapshots: Box<dyn SnapshotStore>) -> Self {
        Self {
            handlers,
            adapter,
            snapshots,
            initial: HashMap::new(),
        }
    }

    pub fn adapter(&self) -> &ServiceProviderAdapter {
        &self.adapter
    }

    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    pub fn expected_task_updates(&self, tm: &TransactionManager) -> TaskExpectation {
        TaskExpectation::from_tasks(tm.all_tasks())
    }

    /// Run handlers on every actionable packet, oldest first
    ///
    /// Replies are buffered as outgoing in `tm` and also returned.
    pub async fn service_actionable_packets(&mut self, tm: &mut TransactionManager) -> MediatorResult<Vec<Packet>> {
        let ids: Vec<TransactionId> = tm
            .actionable_packets()
            .into_iter()
            .map(|ap| ap.transaction_id().clone())
            .collect();
        debug!(count = ids.len(), "PacketManager::service_actionable_packets: called");

        let mut replies = Vec::new();
        for id in ids {
            let Some(apacket) = tm.actionable_packet_mut(&id) else {
                continue;
            };
            let reply = self.service_one(apacket).await?;
            match reply {
                Some(reply) => {
                    self.write_snapshot(apacket, true);
                    info!(target: "amiepackets", apacket = %apacket.name(), reply = %reply.label(), "buffered reply");
                    let now = self.adapter.local().clock().now();
                    tm.buffer_outgoing_amie_packet(now, reply.clone());
                    replies.push(reply);
                }
                None => self.write_snapshot(apacket, false),
            }
        }
        Ok(replies)
    }

    async fn service_one(&self, apacket: &mut ActionablePacket) -> MediatorResult<Option<Packet>> {
        let handler = self.handlers.get(apacket.packet_type());
        match handler.work(apacket, &self.adapter).await {
            Ok(WorkOutcome::Reply(reply)) => Ok(Some(reply)),
            Ok(WorkOutcome::Pending(status)) => self.pending_outcome(apacket, status),
            Err(ServiceError::Timeout(message)) if apacket.find_active_task().is_some() => {
                warn!(apacket = %apacket.name(), %message, "PacketManager::service_one: timed out with a task pending");
                Ok(None)
            }
            Err(ServiceError::RequestFailed(message)) => {
                info!(apacket = %apacket.name(), %message, "PacketManager::service_one: request failed");
                Ok(Some(apacket.create_failure_reply_packet(&message)))
            }
            Err(ServiceError::Validation(err)) => {
                info!(apacket = %apacket.name(), error = %err, "PacketManager::service_one: invalid request");
                Ok(Some(apacket.create_failure_reply_packet(&err.to_string())))
            }
            Err(err) => {
                error!(apacket = %apacket.name(), error = %err, "PacketManager::service_one: handler failed");
                Err(err.into())
            }
        }
    }

    fn pending_outcome(&self, apacket: &ActionablePacket, status: TaskStatus) -> MediatorResult<Option<Packet>> {
        match status.task_state {
            TaskState::Successful => {
                error!(apacket = %apacket.name(), task = %status.task_name, "PacketManager::pending_outcome: handler returned a finished task");
                Err(MediatorError::Handler(format!(
                    "handler for {} returned successful task '{}' instead of a reply",
                    apacket.packet_type(),
                    status.task_name
                )))
            }
            TaskState::Errored => Err(MediatorError::Handler(format!(
                "task '{}' errored: {}",
                status.task_name,
                status.message().unwrap_or_default()
            ))),
            TaskState::Failed => {
                let message = status.message().unwrap_or_else(|| "task failed".to_string());
                Ok(Some(apacket.create_failure_reply_packet(&message)))
            }
            state => {
                debug!(apacket = %apacket.name(), task = %status.task_name, %state, "PacketManager::pending_outcome: waiting");
                Ok(None)
            }
        }
    }

    /// Write the snapshot for `apacket`
    ///
    /// The first write and any `full` write carry the whole record; others
    /// carry the fixed keys plus fields that differ from the first write.
    fn write_snapshot(&mut self, apacket: &ActionablePacket, full: bool) {
        let key = apacket.name();
        let record = apacket.snapshot_record();
        let to_write = match self.initial.get(&key) {
            Some((_, first)) if !full => record
                .iter()
                .filter(|(k, v)| FIXED_SNAPSHOT_KEYS.contains(&k.as_str()) || first.get(k.as_str()) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => record.clone(),
        };
        self.initial
            .entry(key.clone())
            .or_insert_with(|| (apacket.transaction_id().clone(), record));

        if let Err(e) = self.snapshots.update(&key, &to_write) {
            warn!(%key, error = %e, "PacketManager::write_snapshot: failed");
        }
    }

    /// Forget a finished transaction and delete its snapshots
    pub fn purge_transaction(&mut self, id: &TransactionId) {
        let keys: Vec<String> = self
            .initial
            .iter()
            .filter(|(_, (tid, _))| tid == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.initial.remove(&key);
            if let Err(e) = self.snapshots.delete(&key) {
                warn!(%key, error = %e, "PacketManager::purge_transaction: delete failed");
            }
        }
    }
}
