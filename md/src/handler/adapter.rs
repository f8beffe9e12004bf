//! Bridge from packet handlers to the local service
//!
//! The adapter turns an ActionablePacket into typed requests, runs them
//! through the local service proxy, and records every returned task status
//! in the packet so that a task is submitted at most once per job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::apacket::ActionablePacket;
use crate::error::ServiceError;
use crate::provider::LocalServiceProxy;
use crate::request::{LookupKind, LookupRequest, Operation, Role, TaskRequest, strip_role_prefix};
use crate::task::{TaskState, TaskStatus};

pub struct ServiceProviderAdapter {
    local: Arc<LocalServiceProxy>,
}

impl ServiceProviderAdapter {
    pub fn new(local: Arc<LocalServiceProxy>) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &Arc<LocalServiceProxy> {
        &self.local
    }

    fn now(&self) -> DateTime<Utc> {
        self.local.clock().now()
    }

    /// Packet fields as a request sees them: role prefix stripped, `extra` on top
    fn request_fields(
        apacket: &ActionablePacket,
        role: Option<Role>,
        extra: Map<String, Value>,
    ) -> Map<String, Value> {
        let mut fields = match role {
            Some(role) => strip_role_prefix(role, apacket.fields()),
            None => apacket.fields().clone(),
        };
        fields.extend(extra);
        fields
    }

    /// Run the task for `operation`, or return its recorded status
    ///
    /// A task already known for this job is not resubmitted unless it is
    /// `nascent` or was `cleared` by the local service. A `failed` task becomes `RequestFailed`; an `errored` task
    /// becomes `Internal`, which is fatal to the loop.
    pub async fn run_task(
        &self,
        apacket: &mut ActionablePacket,
        operation: Operation,
        role: Option<Role>,
        extra: Map<String, Value>,
    ) -> Result<TaskStatus, ServiceError> {
        debug!(apacket = %apacket.name(), %operation, ?role, "ServiceProviderAdapter::run_task: called");

        let Some(task_name) = self.local.service().local_task_name(operation) else {
            warn!(%operation, "ServiceProviderAdapter::run_task: unsupported operation");
            let mut status = TaskStatus::new(apacket.task_keys(), operation.as_str(), None, self.now(), vec![])?;
            status.fail("Unsupported operation")?;
            return Self::check_status(status);
        };

        let status = match apacket.tasks().get(&task_name) {
            Some(task) if !matches!(task.task_state, TaskState::Nascent | TaskState::Cleared) => {
                debug!(%task_name, state = %task.task_state, "ServiceProviderAdapter::run_task: task already exists");
                task.clone()
            }
            _ => {
                let mut fields = Self::request_fields(apacket, role, extra);
                if let Some(role) = role {
                    if matches!(operation, Operation::ChooseOrAddPerson | Operation::ActivatePerson) {
                        fields.insert("person_role".to_string(), Value::from(role.prefix()));
                    }
                }
                let request =
                    TaskRequest::from_packet_fields(operation, apacket.task_keys(), task_name, self.now(), &fields)?;
                let status = self.local.call(|svc| async move { svc.submit(request).await }).await?;
                apacket.add_or_update_task(status.clone());
                status
            }
        };
        Self::check_status(status)
    }

    /// Whether this job already has a task for `operation`
    pub fn has_task(&self, apacket: &ActionablePacket, operation: Operation) -> bool {
        self.local
            .service()
            .local_task_name(operation)
            .is_some_and(|name| apacket.tasks().get(&name).is_some())
    }

    fn check_status(status: TaskStatus) -> Result<TaskStatus, ServiceError> {
        match status.task_state {
            TaskState::Failed => {
                let message = status.message().unwrap_or_else(|| "task failed".to_string());
                debug!(task_name = %status.task_name, %message, "ServiceProviderAdapter::check_status: failed");
                Err(ServiceError::RequestFailed(message))
            }
            TaskState::Errored => {
                let message = status.message().unwrap_or_else(|| "task errored".to_string());
                error!(task_name = %status.task_name, %message, "ServiceProviderAdapter::check_status: errored");
                Err(ServiceError::Internal(format!("{}: {}", status.task_name, message)))
            }
            _ => Ok(status),
        }
    }

    /// Look up an entity; `None` means it does not exist yet
    pub async fn lookup(
        &self,
        apacket: &ActionablePacket,
        kind: LookupKind,
        role: Option<Role>,
        extra: Map<String, Value>,
    ) -> Result<Option<Value>, ServiceError> {
        debug!(apacket = %apacket.name(), %kind, "ServiceProviderAdapter::lookup: called");
        let fields = Self::request_fields(apacket, role, extra);
        let request = LookupRequest::from_packet_fields(kind, &fields)?;
        self.local.call(|svc| async move { svc.lookup(request).await }).await
    }

    pub async fn clear_transaction(&self, apacket: &ActionablePacket) -> Result<(), ServiceError> {
        let transaction_id = apacket.transaction_id().clone();
        debug!(%transaction_id, "ServiceProviderAdapter::clear_transaction: called");
        self.local
            .call(|svc| async move { svc.clear_transaction(&transaction_id).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::fixtures::account_create;
    use crate::provider::mock::ScriptedLocalService;
    use crate::retry::{RetryConfig, RetryingProxy};
    use crate::task::Product;
    use crate::timing::mock::ManualClock;
    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;

    fn setup(local: ScriptedLocalService) -> (Arc<ScriptedLocalService>, ServiceProviderAdapter) {
        let local = Arc::new(local);
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_500, 0).unwrap()));
        let proxy = RetryingProxy::new("local", local.clone() as Arc<dyn crate::provider::LocalService>, RetryConfig::default(), clock);
        (local, ServiceProviderAdapter::new(Arc::new(proxy)))
    }

    fn apacket() -> ActionablePacket {
        ActionablePacket::new(account_create(100, 42), None).unwrap()
    }

    #[tokio::test]
    async fn test_run_task_submits_once() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        local.script(Operation::ChooseOrAddOrg, TaskState::Queued, vec![]);
        let mut ap = apacket();

        let status = adapter
            .run_task(&mut ap, Operation::ChooseOrAddOrg, Some(Role::User), Map::new())
            .await
            .unwrap();
        assert_eq!(status.task_state, TaskState::Queued);
        assert_eq!(ap.tasks().get("choose_or_add_org").unwrap().task_state, TaskState::Queued);

        let again = adapter
            .run_task(&mut ap, Operation::ChooseOrAddOrg, Some(Role::User), Map::new())
            .await
            .unwrap();
        assert_eq!(again.task_state, TaskState::Queued);
        assert_eq!(local.submissions(Operation::ChooseOrAddOrg), 1);
    }

    #[tokio::test]
    async fn test_cleared_task_is_resubmitted() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        local.script(Operation::ChooseOrAddOrg, TaskState::Successful, vec![Product::new("OrgCode", "0012345")]);
        let mut ap = apacket();
        let cleared = TaskStatus::new(
            ap.task_keys(),
            "choose_or_add_org",
            Some(TaskState::Cleared),
            ap.timestamp() + TimeDelta::seconds(1),
            vec![],
        )
        .unwrap();
        ap.add_or_update_task(cleared);

        let status = adapter
            .run_task(&mut ap, Operation::ChooseOrAddOrg, Some(Role::User), Map::new())
            .await
            .unwrap();
        assert_eq!(status.task_state, TaskState::Successful);
        assert_eq!(local.submissions(Operation::ChooseOrAddOrg), 1);
        assert_eq!(ap.tasks().get("choose_or_add_org").unwrap().task_state, TaskState::Successful);
    }

    #[tokio::test]
    async fn test_request_strips_role_and_adds_person_role() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        let mut ap = apacket();

        adapter
            .run_task(&mut ap, Operation::ChooseOrAddPerson, Some(Role::User), Map::new())
            .await
            .unwrap();
        let request = local.last_request(Operation::ChooseOrAddPerson).unwrap();
        assert_eq!(request.field("FirstName"), Some(&json!("Ada")));
        assert_eq!(request.field("Organization"), Some(&json!("Analytical Engines")));
        assert_eq!(request.field("person_role"), Some(&json!("User")));
        assert!(request.field("UserFirstName").is_none());
        assert_eq!(request.keys.job_id, "100");
    }

    #[tokio::test]
    async fn test_failed_task_is_request_failed() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        local.script(
            Operation::CreateAccount,
            TaskState::Failed,
            vec![Product::new("FAILED", "no such project")],
        );
        let mut ap = apacket();
        let mut extra = Map::new();
        extra.insert("PersonID".to_string(), json!("u-1"));

        let err = adapter
            .run_task(&mut ap, Operation::CreateAccount, None, extra)
            .await
            .unwrap_err();
        match err {
            ServiceError::RequestFailed(msg) => assert_eq!(msg, "no such project"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_errored_task_is_internal() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        local.script(
            Operation::NotifyUser,
            TaskState::Errored,
            vec![Product::new("ERRORED", "template missing")],
        );
        let mut ap = apacket();
        let mut extra = Map::new();
        extra.insert("person_id".to_string(), json!("u-1"));

        let err = adapter
            .run_task(&mut ap, Operation::NotifyUser, None, extra)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
    }

    #[tokio::test]
    async fn test_unsupported_operation_fails() {
        let (local, adapter) = setup(ScriptedLocalService::new().with_unsupported(Operation::MergePerson));
        let mut ap = apacket();

        let err = adapter
            .run_task(&mut ap, Operation::MergePerson, None, Map::new())
            .await
            .unwrap_err();
        match err {
            ServiceError::RequestFailed(msg) => assert_eq!(msg, "Unsupported operation"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(local.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_fields_is_validation_error() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        let mut ap = apacket();

        let err = adapter
            .run_task(&mut ap, Operation::ActivatePerson, None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(local.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_lookup_uses_stripped_fields() {
        let (local, adapter) = setup(ScriptedLocalService::new());
        local.set_lookup(LookupKind::Org, json!("0012345"));
        let ap = apacket();

        let found = adapter.lookup(&ap, LookupKind::Org, Some(Role::User), Map::new()).await.unwrap();
        assert_eq!(found, Some(json!("0012345")));
        assert!(adapter.lookup(&ap, LookupKind::Grant, None, Map::new()).await.unwrap().is_none());
        assert_eq!(local.lookup_count(), 2);
    }
}
