//! Destination-system seam
//!
//! Payload types submitted to the tracking system, the [`DestinationClient`]
//! trait the sync engine depends on, and an HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Repository update submitted to the destination system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryUpdate {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub url: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_requests: Vec<PullRequestEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<CommitEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestEntry {
    pub number: i64,
    pub title: String,
    pub url: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub source_branch: String,
    pub destination_branch: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<CommitEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
    pub hash: String,
    pub message: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

/// Options for a repository submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Ask the destination not to fire workflow transitions for backfilled data
    pub prevent_transitions: bool,
}

/// Destination-system failures
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination returned status {status}: {}", .body.as_deref().unwrap_or("no body"))]
    Http { status: u16, body: Option<String> },
    #[error("destination request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl DestinationError {
    /// Response diagnostics for failure context
    pub fn diagnostics(&self) -> serde_json::Value {
        match self {
            DestinationError::Http { status, body } => json!({
                "status": status,
                "body": body.as_deref().map(truncate_body),
            }),
            DestinationError::Network(err) => json!({
                "network": err.to_string(),
                "timeout": err.is_timeout(),
            }),
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// Writes synchronized data into the destination tracking system.
#[async_trait]
pub trait DestinationClient: Send + Sync {
    async fn submit_repository_update(
        &self,
        tenant_id: &str,
        payload: &RepositoryUpdate,
        options: SubmitOptions,
    ) -> Result<(), DestinationError>;

    async fn notify_migration_complete(&self, tenant_id: &str) -> Result<(), DestinationError>;
}

/// HTTP destination client
#[derive(Clone)]
pub struct HttpDestinationClient {
    http: reqwest::Client,
    api_base: String,
    api_token: Option<String>,
}

impl HttpDestinationClient {
    pub fn new<S: Into<String>>(api_base: S, api_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<(), DestinationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.ok().filter(|body| !body.is_empty());
        Err(DestinationError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DestinationClient for HttpDestinationClient {
    async fn submit_repository_update(
        &self,
        tenant_id: &str,
        payload: &RepositoryUpdate,
        options: SubmitOptions,
    ) -> Result<(), DestinationError> {
        let url = format!("{}/tenants/{}/devinfo/bulk", self.api_base, tenant_id);
        let body = json!({
            "preventTransitions": options.prevent_transitions,
            "repositories": [payload],
        });

        let response = self
            .authorize(self.http.post(url).json(&body))
            .send()
            .await?;
        Self::check(response).await?;

        debug!(
            tenant_id,
            repository_id = payload.id,
            pull_requests = payload.pull_requests.len(),
            branches = payload.branches.len(),
            commits = payload.commits.len(),
            "Submitted repository update"
        );
        Ok(())
    }

    async fn notify_migration_complete(&self, tenant_id: &str) -> Result<(), DestinationError> {
        let url = format!("{}/tenants/{}/migration/complete", self.api_base, tenant_id);
        let response = self.authorize(self.http.put(url)).send().await?;
        Self::check(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> RepositoryUpdate {
        RepositoryUpdate {
            id: 42,
            name: "widgets".to_string(),
            full_name: "acme/widgets".to_string(),
            url: "https://github.com/acme/widgets".to_string(),
            updated_at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            pull_requests: Vec::new(),
            branches: vec![BranchEntry {
                name: "main".to_string(),
                last_commit: None,
            }],
            commits: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_sends_prevent_transitions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenants/acme/devinfo/bulk"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "preventTransitions": true,
                "repositories": [{ "id": 42, "branches": [{ "name": "main" }] }]
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDestinationClient::new(server.uri(), Some("secret".to_string()));
        client
            .submit_repository_update(
                "acme",
                &payload(),
                SubmitOptions {
                    prevent_transitions: true,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_failure_keeps_diagnostics() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenants/acme/devinfo/bulk"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid payload"))
            .mount(&server)
            .await;

        let client = HttpDestinationClient::new(server.uri(), None);
        let error = client
            .submit_repository_update("acme", &payload(), SubmitOptions::default())
            .await
            .unwrap_err();

        let diagnostics = error.diagnostics();
        assert_eq!(diagnostics["status"], 400);
        assert_eq!(diagnostics["body"], "invalid payload");
    }

    #[tokio::test]
    async fn test_notify_migration_complete() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/tenants/acme/migration/complete"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDestinationClient::new(server.uri(), None);
        client.notify_migration_complete("acme").await.unwrap();
    }
}
