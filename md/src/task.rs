//! Task status model
//!
//! A `TaskStatus` is the local service's record of one unit of work done on
//! behalf of a packet. All tasks for one packet (a "job") are collected in a
//! `TaskStatusList`, keyed by task name and merged by timestamp.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ValidationError;
use crate::packet::TransactionId;

/// Product name that carries the message of a failed task
pub const FAILED_PRODUCT: &str = "FAILED";

/// Product name that carries the message of an errored task
pub const ERRORED_PRODUCT: &str = "ERRORED";

/// Lifecycle state of a local task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Nascent,
    Queued,
    InProgress,
    Delegated,
    Syncing,
    Successful,
    Failed,
    Errored,
    Cleared,
}

impl TaskState {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Successful | TaskState::Failed | TaskState::Errored | TaskState::Cleared
        )
    }

    /// The local service is actively working on the task
    pub fn is_busy(self) -> bool {
        matches!(self, TaskState::InProgress | TaskState::Delegated | TaskState::Syncing)
    }

    /// The task is waiting to be picked up
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskState::Nascent | TaskState::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Nascent => "nascent",
            TaskState::Queued => "queued",
            TaskState::InProgress => "in-progress",
            TaskState::Delegated => "delegated",
            TaskState::Syncing => "syncing",
            TaskState::Successful => "successful",
            TaskState::Failed => "failed",
            TaskState::Errored => "errored",
            TaskState::Cleared => "cleared",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nascent" => Ok(TaskState::Nascent),
            "queued" => Ok(TaskState::Queued),
            "in-progress" => Ok(TaskState::InProgress),
            "delegated" => Ok(TaskState::Delegated),
            "syncing" => Ok(TaskState::Syncing),
            "successful" => Ok(TaskState::Successful),
            "failed" => Ok(TaskState::Failed),
            "errored" => Ok(TaskState::Errored),
            "cleared" => Ok(TaskState::Cleared),
            other => Err(ValidationError::Invalid(format!("Unknown task state: {}", other))),
        }
    }
}

/// One named result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub value: Value,
}

impl Product {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Keys that tie a task to the packet (job) it serves
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKeys {
    pub job_id: String,
    #[serde(rename = "amie_transaction_id")]
    pub transaction_id: TransactionId,
    #[serde(rename = "amie_packet_id")]
    pub packet_id: String,
    #[serde(rename = "amie_packet_type")]
    pub packet_type: String,
}

/// Status of one local task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTaskStatus")]
pub struct TaskStatus {
    #[serde(flatten)]
    pub keys: TaskKeys,
    pub task_name: String,
    pub task_state: TaskState,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub products: Vec<Product>,
}

#[derive(Deserialize)]
struct RawTaskStatus {
    #[serde(flatten)]
    keys: TaskKeys,
    task_name: String,
    #[serde(default)]
    task_state: Option<TaskState>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    products: Vec<Product>,
}

impl TryFrom<RawTaskStatus> for TaskStatus {
    type Error = ValidationError;

    fn try_from(raw: RawTaskStatus) -> Result<Self, Self::Error> {
        TaskStatus::new(raw.keys, raw.task_name, raw.task_state, raw.timestamp, raw.products)
    }
}

impl TaskStatus {
    /// Create a task status, reconciling the state with the products
    ///
    /// A `FAILED` product forces the `failed` state and an `ERRORED` product
    /// forces `errored`. Asking for `failed` or `errored` without the
    /// matching product is an error. An unset state means `nascent`.
    pub fn new(
        keys: TaskKeys,
        task_name: impl Into<String>,
        task_state: Option<TaskState>,
        timestamp: DateTime<Utc>,
        products: Vec<Product>,
    ) -> Result<Self, ValidationError> {
        let task_name = task_name.into();
        debug!(%task_name, ?task_state, "TaskStatus::new: called");
        if task_name.trim().is_empty() {
            return Err(ValidationError::Invalid("task_name must not be empty".to_string()));
        }

        let has_failed = products.iter().any(|p| p.name == FAILED_PRODUCT);
        let has_errored = products.iter().any(|p| p.name == ERRORED_PRODUCT);

        let task_state = match task_state {
            Some(TaskState::Failed) if !has_failed => {
                return Err(ValidationError::Invalid(format!(
                    "Task '{}' is failed but has no {} product",
                    task_name, FAILED_PRODUCT
                )));
            }
            Some(TaskState::Errored) if !has_errored => {
                return Err(ValidationError::Invalid(format!(
                    "Task '{}' is errored but has no {} product",
                    task_name, ERRORED_PRODUCT
                )));
            }
            _ if has_failed => TaskState::Failed,
            _ if has_errored => TaskState::Errored,
            Some(state) => state,
            None => TaskState::Nascent,
        };

        Ok(Self {
            keys,
            task_name,
            task_state,
            timestamp,
            products,
        })
    }

    /// Mark the task failed with an explanatory message
    pub fn fail(&mut self, message: &str) -> Result<(), ValidationError> {
        self.finish_with(TaskState::Failed, FAILED_PRODUCT, message)
    }

    /// Mark the task errored with an explanatory message
    pub fn error(&mut self, message: &str) -> Result<(), ValidationError> {
        self.finish_with(TaskState::Errored, ERRORED_PRODUCT, message)
    }

    fn finish_with(&mut self, state: TaskState, product: &str, message: &str) -> Result<(), ValidationError> {
        debug!(task_name = %self.task_name, %state, "TaskStatus::finish_with: called");
        let message = message.trim();
        if message.is_empty() {
            return Err(ValidationError::Invalid(format!("{} message must not be empty", product)));
        }
        self.products.push(Product::new(product, message));
        self.task_state = state;
        Ok(())
    }

    /// First product with the given name
    pub fn get_product_value(&self, name: &str) -> Option<&Value> {
        self.products.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Product value rendered as a string; JSON strings are unquoted
    pub fn product_string(&self, name: &str) -> Option<String> {
        self.get_product_value(name).and_then(value_to_string)
    }

    /// Message for a failed or errored task
    pub fn message(&self) -> Option<String> {
        match self.task_state {
            TaskState::Failed => self.product_string(FAILED_PRODUCT),
            TaskState::Errored => self.product_string(ERRORED_PRODUCT),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.task_state.is_terminal()
    }
}

/// Render a scalar JSON value as a plain string
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// All tasks for one job, keyed by task name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatusList {
    tasks: HashMap<String, TaskStatus>,
}

impl TaskStatusList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a task; returns true if the list changed
    ///
    /// An existing task is replaced only by a strictly newer one.
    pub fn put(&mut self, status: TaskStatus) -> bool {
        if let Some(existing) = self.tasks.get(&status.task_name) {
            if existing.timestamp >= status.timestamp {
                debug!(task_name = %status.task_name, "TaskStatusList::put: not newer, ignoring");
                return false;
            }
        }
        debug!(task_name = %status.task_name, state = %status.task_state, "TaskStatusList::put: stored");
        self.tasks.insert(status.task_name.clone(), status);
        true
    }

    /// Put every task; returns true if any changed the list
    pub fn put_all<I: IntoIterator<Item = TaskStatus>>(&mut self, statuses: I) -> bool {
        statuses.into_iter().fold(false, |changed, s| self.put(s) || changed)
    }

    pub fn get(&self, task_name: &str) -> Option<&TaskStatus> {
        self.tasks.get(task_name)
    }

    /// Tasks ordered by timestamp, ties broken by name
    pub fn get_list(&self) -> Vec<&TaskStatus> {
        let mut list: Vec<&TaskStatus> = self.tasks.values().collect();
        list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.task_name.cmp(&b.task_name)));
        list
    }

    /// The newest non-terminal task, if any
    pub fn find_active_task(&self) -> Option<&TaskStatus> {
        self.get_list().into_iter().rev().find(|t| t.is_active())
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.tasks.values().map(|t| t.timestamp).max()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskStatus> {
        self.tasks.values()
    }
}

impl FromIterator<TaskStatus> for TaskStatusList {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut list = TaskStatusList::new();
        list.put_all(iter);
        list
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_failed_requires_product() {
        let result = TaskStatus::new(keys(), "create_account", Some(TaskState::Failed), at(0), vec![]);
        assert!(matches!(result, Err(ValidationError::Invalid(_))));

        let result = TaskStatus::new(keys(), "create_account", Some(TaskState::Errored), at(0), vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_product_sets_state() {
        let products = vec![Product::new(FAILED_PRODUCT, "no such project")];
        let ts = TaskStatus::new(keys(), "create_account", None, at(0), products.clone()).unwrap();
        assert_eq!(ts.task_state, TaskState::Failed);
        assert_eq!(ts.product_string(FAILED_PRODUCT).as_deref(), Some("no such project"));

        let ts = TaskStatus::new(keys(), "create_account", Some(TaskState::Failed), at(0), products).unwrap();
        assert_eq!(ts.task_state, TaskState::Failed);
        assert_eq!(ts.message().as_deref(), Some("no such project"));
    }

    #[test]
    fn test_errored_product_sets_state() {
        let products = vec![Product::new(ERRORED_PRODUCT, "db down")];
        let ts = TaskStatus::new(keys(), "notify_user", Some(TaskState::Queued), at(0), products).unwrap();
        assert_eq!(ts.task_state, TaskState::Errored);
    }

    #[test]
    fn test_unset_state_is_nascent() {
        let ts = TaskStatus::new(keys(), "notify_user", None, at(0), vec![]).unwrap();
        assert_eq!(ts.task_state, TaskState::Nascent);
    }

    #[test]
    fn test_fail_and_error_require_message() {
        let mut ts = task("notify_user", TaskState::InProgress, 0);
        assert!(ts.fail("   ").is_err());
        assert_eq!(ts.task_state, TaskState::InProgress);

        ts.fail("  mailbox full ").unwrap();
        assert_eq!(ts.task_state, TaskState::Failed);
        assert_eq!(ts.product_string(FAILED_PRODUCT).as_deref(), Some("mailbox full"));

        let mut ts = task("notify_user", TaskState::InProgress, 0);
        ts.error("bad config").unwrap();
        assert_eq!(ts.task_state, TaskState::Errored);
        assert_eq!(ts.message().as_deref(), Some("bad config"));
    }

    #[test]
    fn test_get_product_first_match_wins() {
        let products = vec![Product::new("PersonID", "p1"), Product::new("PersonID", "p2")];
        let ts = TaskStatus::new(keys(), "choose_or_add_person", Some(TaskState::Successful), at(0), products).unwrap();
        assert_eq!(ts.product_string("PersonID").as_deref(), Some("p1"));
        assert!(ts.get_product_value("OrgCode").is_none());
    }

    #[test]
    fn test_state_display_roundtrip() {
        for state in [TaskState::Nascent, TaskState::InProgress, TaskState::Cleared] {
            assert_eq!(state.to_string().parse::<TaskState>().unwrap(), state);
        }
        assert!("sleeping".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{
            "job_id": "9001",
            "amie_transaction_id": "X-ORIG:X-REMOTE:X-LOCAL:42",
            "amie_packet_id": "3",
            "amie_packet_type": "request_account_create",
            "task_name": "create_account",
            "task_state": "failed",
            "timestamp": 1700000000000,
            "products": []
        }"#;
        assert!(serde_json::from_str::<TaskStatus>(json).is_err());

        let json = json.replace("\"products\": []", "\"products\": [{\"name\": \"FAILED\", \"value\": \"nope\"}]");
        let ts: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(ts.task_state, TaskState::Failed);
        assert_eq!(ts.keys.transaction_id.transaction_id, "42");
    }

    #[test]
    fn test_put_ignores_older_and_equal() {
        let mut list = TaskStatusList::new();
        assert!(list.put(task("create_account", TaskState::Queued, 10)));
        assert!(!list.put(task("create_account", TaskState::Successful, 5)));
        assert!(!list.put(task("create_account", TaskState::Successful, 10)));
        assert_eq!(list.get("create_account").unwrap().task_state, TaskState::Queued);

        assert!(list.put(task("create_account", TaskState::Successful, 11)));
        assert_eq!(list.get("create_account").unwrap().task_state, TaskState::Successful);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_get_list_orders_by_timestamp() {
        let list: TaskStatusList = vec![
            task("c", TaskState::Successful, 30),
            task("a", TaskState::Successful, 10),
            task("b", TaskState::Queued, 20),
        ]
        .into_iter()
        .collect();
        let names: Vec<&str> = list.get_list().iter().map(|t| t.task_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(list.find_active_task().unwrap().task_name, "b");
        assert_eq!(list.latest_timestamp(), Some(at(30)));
    }

    #[test]
    fn test_find_active_none_when_all_terminal() {
        let list: TaskStatusList = vec![task("a", TaskState::Successful, 1), task("b", TaskState::Cleared, 2)]
            .into_iter()
            .collect();
        assert!(list.find_active_task().is_none());
    }

    fn any_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            Just(TaskState::Nascent),
            Just(TaskState::Queued),
            Just(TaskState::InProgress),
            Just(TaskState::Delegated),
            Just(TaskState::Syncing),
            Just(TaskState::Successful),
            Just(TaskState::Cleared),
        ]
    }

    proptest! {
        #[test]
        fn prop_duplicate_put_is_idempotent(state in any_state(), secs in 0i64..10_000) {
            let a = task("define_person", state, secs);
            let mut list = TaskStatusList::new();
            list.put_all(vec![a.clone(), a.clone()]);
            prop_assert_eq!(list.len(), 1);
            prop_assert_eq!(list.get("define_person"), Some(&a));
        }

        #[test]
        fn prop_newest_put_wins(
            updates in proptest::collection::vec((any_state(), 0i64..1_000), 1..20)
        ) {
            let mut list = TaskStatusList::new();
            for (state, secs) in &updates {
                list.put(task("create_project", *state, *secs));
            }
            let newest = updates.iter().map(|(_, secs)| *secs).max().unwrap();
            let first_newest = updates.iter().find(|(_, secs)| *secs == newest).map(|(s, _)| *s).unwrap();
            let held = list.get("create_project").unwrap();
            prop_assert_eq!(held.timestamp, at(newest));
            prop_assert_eq!(held.task_state, first_newest);
        }

        #[test]
        fn prop_at_most_one_active_per_name(
            updates in proptest::collection::vec((any_state(), 0i64..1_000), 1..20)
        ) {
            let mut list = TaskStatusList::new();
            for (state, secs) in &updates {
                list.put(task("notify_user", *state, *secs));
            }
            let active = list.iter().filter(|t| t.is_active()).count();
            prop_assert!(active <= 1);
            prop_assert_eq!(list.find_active_task().is_some(), active == 1);
        }
    }
}
