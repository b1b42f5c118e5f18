//! GitHub source-host client
//!
//! Thin `reqwest` client for the GitHub GraphQL endpoint (paginated repository
//! history) and the REST installation-repositories listing used by discovery.
//! Every failure is converted into a [`SourceError`] carrying the HTTP status,
//! GraphQL `errors[].type` and, for exhausted rate limits, the reset time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::progress::RepositorySummary;
use crate::source::{RepositoryLister, SourceError, SourceErrorEntry, TokenSource};

/// Default GitHub API base URL
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "repo-sync/0.1";
const REPOSITORIES_PER_PAGE: usize = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// GitHub API client scoped to installations
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositories {
    repositories: Vec<GitHubRepository>,
}

#[derive(Debug, Deserialize)]
struct GitHubRepository {
    id: i64,
    name: String,
    full_name: String,
    owner: GitHubOwner,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GitHubOwner {
    login: String,
}

impl From<GraphQlError> for SourceErrorEntry {
    fn from(error: GraphQlError) -> Self {
        SourceErrorEntry {
            error_type: error.error_type,
            message: error.message,
        }
    }
}

impl GitHubClient {
    /// Create a new client against the given API base URL
    pub fn new<S: Into<String>>(api_base: S, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_timeout(api_base, tokens, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a new client with an explicit per-request timeout
    pub fn with_timeout<S: Into<String>>(
        api_base: S,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Run a GraphQL query for an installation and return its `data` object.
    pub async fn graphql(
        &self,
        installation_id: i64,
        query: &str,
        variables: JsonValue,
    ) -> Result<JsonValue, SourceError> {
        let token = self.tokens.token(installation_id).await?;

        let response = self
            .http
            .post(format!("{}/graphql", self.api_base))
            .bearer_auth(token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status.as_u16(), &headers, &body));
        }

        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|err| SourceError::new(format!("Malformed GitHub GraphQL response: {}", err)))?;

        if !body.errors.is_empty() {
            let message = body
                .errors
                .iter()
                .filter_map(|error| error.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            debug!(installation_id, %message, "GitHub GraphQL query returned errors");
            let mut error = SourceError::http(status.as_u16(), message)
                .with_errors(body.errors.into_iter().map(Into::into).collect());
            if let Some(reset) = exhausted_rate_limit_reset(status.as_u16(), &headers) {
                error = error.with_rate_limit_reset(reset);
            }
            return Err(error);
        }

        body.data
            .ok_or_else(|| SourceError::new("GitHub GraphQL response carried no data"))
    }

    async fn fetch_repository_page(
        &self,
        installation_id: i64,
        page: usize,
    ) -> Result<Vec<GitHubRepository>, SourceError> {
        let token = self.tokens.token(installation_id).await?;

        let response = self
            .http
            .get(format!("{}/installation/repositories", self.api_base))
            .query(&[
                ("per_page", REPOSITORIES_PER_PAGE.to_string()),
                ("page", page.to_string()),
            ])
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status.as_u16(), &headers, &body));
        }

        let body: InstallationRepositories = response.json().await.map_err(|err| {
            SourceError::new(format!("Malformed GitHub repositories response: {}", err))
        })?;

        Ok(body.repositories)
    }
}

#[async_trait]
impl RepositoryLister for GitHubClient {
    async fn list_repositories(
        &self,
        installation_id: i64,
    ) -> Result<Vec<RepositorySummary>, SourceError> {
        let mut repositories = Vec::new();
        let mut page = 1;

        loop {
            let batch = self.fetch_repository_page(installation_id, page).await?;
            let batch_len = batch.len();

            repositories.extend(batch.into_iter().map(|repo| RepositorySummary {
                id: repo.id,
                name: repo.name,
                owner: repo.owner.login,
                full_name: repo.full_name,
                updated_at: repo.updated_at,
            }));

            if batch_len < REPOSITORIES_PER_PAGE {
                break;
            }
            page += 1;
        }

        debug!(
            installation_id,
            repositories = repositories.len(),
            "Listed installation repositories"
        );

        Ok(repositories)
    }
}

fn network_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        warn!(error = %err, "GitHub request timed out");
        SourceError::new(format!("GitHub request timed out: {}", err))
    } else {
        SourceError::new(format!("GitHub request failed: {}", err))
    }
}

fn http_error(status: u16, headers: &HeaderMap, body: &str) -> SourceError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|parsed| parsed.message.clone())
        .unwrap_or_else(|| format!("GitHub API returned status {}", status));

    let mut error = SourceError::http(status, message);
    if let Some(parsed) = parsed
        && !parsed.errors.is_empty()
    {
        error = error.with_errors(parsed.errors.into_iter().map(Into::into).collect());
    }
    if let Some(reset) = exhausted_rate_limit_reset(status, headers) {
        warn!(status, reset, "GitHub rate limit exhausted");
        error = error.with_rate_limit_reset(reset);
    }
    error
}

/// Reset time (epoch seconds) when the response reports an exhausted rate limit.
///
/// GitHub sends `X-RateLimit-Reset` on every response, so it only counts when the
/// remaining budget is zero or the status is 429.
fn exhausted_rate_limit_reset(status: u16, headers: &HeaderMap) -> Option<i64> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    let reset = header_value("x-ratelimit-reset")?.parse::<i64>().ok()?;
    let exhausted = header_value("x-ratelimit-remaining").as_deref() == Some("0");

    (exhausted || status == 429).then_some(reset)
}
