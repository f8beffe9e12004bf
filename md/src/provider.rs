//! Local service collaborator
//!
//! The local service owns the site's accounts, projects and people. Every
//! state-changing operation runs as a task whose status the mediator polls;
//! lookups are plain reads. `HttpLocalService` speaks to the site's REST
//! endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::config::LocalConfig;
use crate::error::ServiceError;
use crate::packet::TransactionId;
use crate::request::{LookupRequest, Operation, TaskRequest};
use crate::retry::RetryingProxy;
use crate::task::TaskStatus;

/// The single proxy all local service calls go through
pub type LocalServiceProxy = RetryingProxy<dyn LocalService>;

/// Operations the mediator needs from the local service
#[async_trait]
pub trait LocalService: Send + Sync {
    /// Site task name for an operation, or `None` if the site does not support it
    fn local_task_name(&self, operation: Operation) -> Option<String>;

    /// Task updates since `since`, blocking up to `wait_secs` for a change
    async fn get_tasks(
        &self,
        active: bool,
        wait_secs: u64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskStatus>, ServiceError>;

    /// Drop the site's records of a finished transaction
    async fn clear_transaction(&self, transaction_id: &TransactionId) -> Result<(), ServiceError>;

    /// Look up an existing entity without creating a task
    async fn lookup(&self, request: LookupRequest) -> Result<Option<Value>, ServiceError>;

    /// Submit a task; the returned status may not be terminal yet
    async fn submit(&self, request: TaskRequest) -> Result<TaskStatus, ServiceError>;
}

/// `LocalService` over the site's HTTP API
pub struct HttpLocalService {
    base_url: String,
    http: Client,
    timeout: Duration,
    task_names: HashMap<String, String>,
    unsupported: Vec<String>,
}

impl HttpLocalService {
    pub fn from_config(config: &LocalConfig) -> Result<Self, ServiceError> {
        debug!(base_url = %config.base_url, "HttpLocalService::from_config: called");
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder().timeout(timeout).build().map_err(ServiceError::from_http)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
            task_names: config.task_names.clone(),
            unsupported: config.unsupported.clone(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "HttpLocalService::check: error response");
        Err(ServiceError::from_status(status.as_u16(), text))
    }
}

#[async_trait]
impl LocalService for HttpLocalService {
    fn local_task_name(&self, operation: Operation) -> Option<String> {
        let name = operation.as_str();
        if self.unsupported.iter().any(|u| u == name) {
            return None;
        }
        Some(self.task_names.get(name).cloned().unwrap_or_else(|| name.to_string()))
    }

    async fn get_tasks(
        &self,
        active: bool,
        wait_secs: u64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskStatus>, ServiceError> {
        debug!(active, wait_secs, ?since, "HttpLocalService::get_tasks: called");
        let mut query = vec![("active", active.to_string()), ("wait", wait_secs.to_string())];
        if let Some(since) = since {
            query.push(("since", since.timestamp_millis().to_string()));
        }

        let response = self
            .http
            .get(format!("{}/tasks", self.base_url))
            .query(&query)
            // the server may hold the request open for up to wait_secs
            .timeout(self.timeout + Duration::from_secs(wait_secs))
            .send()
            .await
            .map_err(ServiceError::from_http)?;
        let tasks: Vec<TaskStatus> = Self::check(response).await?.json().await.map_err(ServiceError::from_http)?;
        debug!(count = tasks.len(), "HttpLocalService::get_tasks: received");
        Ok(tasks)
    }

    async fn clear_transaction(&self, transaction_id: &TransactionId) -> Result<(), ServiceError> {
        debug!(%transaction_id, "HttpLocalService::clear_transaction: called");
        let response = self
            .http
            .post(format!("{}/transactions/{}/clear", self.base_url, transaction_id))
            .send()
            .await
            .map_err(ServiceError::from_http)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn lookup(&self, request: LookupRequest) -> Result<Option<Value>, ServiceError> {
        debug!(kind = %request.kind, "HttpLocalService::lookup: called");
        let response = self
            .http
            .post(format!("{}/lookup/{}", self.base_url, request.kind))
            .json(&request)
            .send()
            .await
            .map_err(ServiceError::from_http)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = Self::check(response).await?.json().await.map_err(ServiceError::from_http)?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn submit(&self, request: TaskRequest) -> Result<TaskStatus, ServiceError> {
        debug!(operation = %request.operation, task_name = %request.task_name, "HttpLocalService::submit: called");
        let response = self
            .http
            .post(format!("{}/tasks/{}", self.base_url, request.operation))
            .json(&request)
            .send()
            .await
            .map_err(ServiceError::from_http)?;
        let status: TaskStatus = Self::check(response).await?.json().await.map_err(ServiceError::from_http)?;
        debug!(task_name = %status.task_name, state = %status.task_state, "HttpLocalService::submit: accepted");
        Ok(status)
    }
}
