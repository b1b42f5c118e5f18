//! Source-host seam
//!
//! Typed errors raised by source-host reads and the traits the sync engine and
//! discovery use to talk to the source host without knowing which client is
//! behind them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::progress::RepositorySummary;

pub mod github;

pub use github::GitHubClient;

/// GraphQL error types that mean "the requested page was too large"
const CAPACITY_ERROR_TYPES: &[&str] = &["MAX_NODE_LIMIT_EXCEEDED", "RESOURCE_LIMITS_EXCEEDED"];

/// GraphQL error type for a repository that no longer exists
const NOT_FOUND_ERROR_TYPE: &str = "NOT_FOUND";

/// One entry of a GraphQL `errors` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceErrorEntry {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Failure of a source-host read
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,
    /// HTTP status of the failed response, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SourceErrorEntry>,
    /// Epoch seconds at which an exhausted rate limit resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset: Option<i64>,
}

impl SourceError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            status: None,
            errors: Vec::new(),
            rate_limit_reset: None,
        }
    }

    pub fn http<S: Into<String>>(status: u16, message: S) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        Self::new(message.clone()).with_errors(vec![SourceErrorEntry {
            error_type: Some(NOT_FOUND_ERROR_TYPE.to_string()),
            message: Some(message),
        }])
    }

    pub fn with_errors(mut self, errors: Vec<SourceErrorEntry>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_rate_limit_reset(mut self, reset_epoch_seconds: i64) -> Self {
        self.rate_limit_reset = Some(reset_epoch_seconds);
        self
    }

    pub fn has_error_type(&self, error_type: &str) -> bool {
        self.errors
            .iter()
            .any(|entry| entry.error_type.as_deref() == Some(error_type))
    }

    /// The requested page size exceeded a provider-side limit.
    pub fn is_capacity_exceeded(&self) -> bool {
        CAPACITY_ERROR_TYPES
            .iter()
            .any(|error_type| self.has_error_type(error_type))
    }

    /// The target repository does not exist (anymore).
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || self.has_error_type(NOT_FOUND_ERROR_TYPE)
    }
}

/// Supplies the credential used for one installation's source-host calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, installation_id: i64) -> Result<String, SourceError>;
}

/// Same token for every installation (configured personal or app token).
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _installation_id: i64) -> Result<String, SourceError> {
        Ok(self.token.clone())
    }
}

/// Lists the repositories an installation grants access to.
#[async_trait]
pub trait RepositoryLister: Send + Sync {
    async fn list_repositories(
        &self,
        installation_id: i64,
    ) -> Result<Vec<RepositorySummary>, SourceError>;
}
