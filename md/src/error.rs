//! Error types for the mediator
//!
//! `ServiceError` is what the remote and local collaborators return,
//! `ValidationError` covers malformed task records and request objects, and
//! `MediatorError` is what escapes the packet loop.

use thiserror::Error;

/// Errors from calls into the remote or local service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Temporary service error: {0}")]
    Temporary(String),

    #[error("Retry time limit exceeded: {0}")]
    Timeout(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Internal service error: {0}")]
    Internal(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ServiceError {
    /// Transient errors are absorbed by `RetryingProxy` and the supervisor
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Connection(_) | ServiceError::Temporary(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Timeout(_))
    }

    /// Classify a reqwest failure
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ServiceError::Connection(err.to_string())
        } else if err.is_decode() {
            ServiceError::Internal(format!("Undecodable response: {}", err))
        } else {
            ServiceError::Temporary(err.to_string())
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            408 | 429 | 500 | 502 | 503 | 504 => ServiceError::Temporary(format!("HTTP {}: {}", status, message)),
            400 | 409 | 422 => ServiceError::RequestFailed(message),
            _ => ServiceError::Internal(format!("HTTP {}: {}", status, message)),
        }
    }
}

/// Errors from validating task records or request fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Fields not allowed: {}", .0.join(", "))]
    DisallowedFields(Vec<String>),

    #[error("Missing required fields: {}; fields not allowed: {}", .missing.join(", "), .disallowed.join(", "))]
    Fields { missing: Vec<String>, disallowed: Vec<String> },

    #[error("{0}")]
    Invalid(String),
}

impl ValidationError {
    /// Build the narrowest variant for a set of field problems
    pub fn from_fields(missing: Vec<String>, disallowed: Vec<String>) -> Option<Self> {
        match (missing.is_empty(), disallowed.is_empty()) {
            (true, true) => None,
            (false, true) => Some(ValidationError::MissingFields(missing)),
            (true, false) => Some(ValidationError::DisallowedFields(disallowed)),
            (false, false) => Some(ValidationError::Fields { missing, disallowed }),
        }
    }
}

/// Errors that terminate a pass of the packet loop
#[derive(Debug, Error)]
pub enum MediatorError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Packet handler error: {0}")]
    Handler(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),
}

impl MediatorError {
    /// Whether the supervisor may restart the loop after this error
    pub fn is_restartable(&self) -> bool {
        match self {
            MediatorError::Service(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type MediatorResult<T> = Result<T, MediatorError>;
