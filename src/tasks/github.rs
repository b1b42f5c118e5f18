//! GitHub GraphQL task handlers
//!
//! Each handler reads one GraphQL connection page (`edges { cursor node }`)
//! of a repository and maps the nodes into a [`RepositoryUpdate`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};

use crate::destination::{BranchEntry, CommitEntry, PullRequestEntry, RepositoryUpdate};
use crate::progress::RepositorySummary;
use crate::source::{GitHubClient, SourceError};
use crate::tasks::{Edge, PageResult, TaskHandler};

const PULL_REQUESTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    url
    pullRequests(first: $first, after: $after, orderBy: { field: CREATED_AT, direction: ASC }) {
      edges {
        cursor
        node {
          number
          title
          url
          state
          updatedAt
          headRefName
          baseRefName
          author { login }
        }
      }
    }
  }
}
"#;

const BRANCHES_QUERY: &str = r#"
query($owner: String!, $name: String!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    url
    refs(refPrefix: "refs/heads/", first: $first, after: $after) {
      edges {
        cursor
        node {
          name
          target {
            ... on Commit {
              oid
              message
              url
              committedDate
              author { name email }
            }
          }
        }
      }
    }
  }
}
"#;

const COMMITS_QUERY: &str = r#"
query($owner: String!, $name: String!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    url
    defaultBranchRef {
      target {
        ... on Commit {
          history(first: $first, after: $after) {
            edges {
              cursor
              node {
                oid
                message
                url
                committedDate
                author { name email }
              }
            }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<ConnectionEdge<T>>,
}

#[derive(Debug, Deserialize)]
struct ConnectionEdge<T> {
    cursor: String,
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestNode {
    number: i64,
    title: String,
    url: String,
    state: String,
    updated_at: DateTime<Utc>,
    head_ref_name: String,
    base_ref_name: String,
    #[serde(default)]
    author: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RefNode {
    name: String,
    #[serde(default)]
    target: Option<CommitNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitNode {
    oid: String,
    message: String,
    url: String,
    #[serde(default)]
    committed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    author: Option<GitActor>,
}

#[derive(Debug, Deserialize)]
struct GitActor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl From<CommitNode> for CommitEntry {
    fn from(node: CommitNode) -> Self {
        let (author_name, author_email) = node
            .author
            .map(|author| (author.name, author.email))
            .unwrap_or_default();
        CommitEntry {
            hash: node.oid,
            message: node.message,
            url: node.url,
            author_name,
            author_email,
            committed_at: node.committed_date,
        }
    }
}

/// Run a repository-scoped query and return the `repository` object.
///
/// A `null` repository means it was deleted or access was revoked.
async fn query_repository(
    client: &GitHubClient,
    installation_id: i64,
    repository: &RepositorySummary,
    query: &str,
    cursor: Option<&str>,
    page_size: u32,
) -> Result<JsonValue, SourceError> {
    let variables = json!({
        "owner": repository.owner,
        "name": repository.name,
        "first": page_size,
        "after": cursor,
    });

    let data = client.graphql(installation_id, query, variables).await?;
    match data.get("repository") {
        Some(repo) if !repo.is_null() => Ok(repo.clone()),
        _ => Err(SourceError::not_found(format!(
            "Could not resolve to a Repository with the name '{}'.",
            repository.full_name
        ))),
    }
}

/// Decode the connection found at `pointer`; a missing or `null` connection is empty.
fn connection<T: DeserializeOwned>(
    repo: &JsonValue,
    pointer: &str,
) -> Result<Vec<ConnectionEdge<T>>, SourceError> {
    match repo.pointer(pointer) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value::<Connection<T>>(value.clone())
            .map(|connection| connection.edges)
            .map_err(|err| SourceError::new(format!("Malformed GitHub connection: {}", err))),
    }
}

fn repository_update(repo: &JsonValue, repository: &RepositorySummary) -> RepositoryUpdate {
    let url = repo
        .get("url")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://github.com/{}", repository.full_name));

    RepositoryUpdate {
        id: repository.id,
        name: repository.name.clone(),
        full_name: repository.full_name.clone(),
        url,
        updated_at: repository.updated_at,
        pull_requests: Vec::new(),
        branches: Vec::new(),
        commits: Vec::new(),
    }
}

/// Split edges into cursors and nodes.
fn split_edges<T>(edges: Vec<ConnectionEdge<T>>) -> (Vec<Edge>, Vec<T>) {
    edges
        .into_iter()
        .map(|edge| (Edge::new(edge.cursor), edge.node))
        .unzip()
}

/// Pull requests in creation order
pub struct PullRequestTask {
    client: Arc<GitHubClient>,
}

impl PullRequestTask {
    pub fn new(client: Arc<GitHubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskHandler for PullRequestTask {
    async fn fetch_page(
        &self,
        installation_id: i64,
        repository: &RepositorySummary,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<PageResult, SourceError> {
        let repo = query_repository(
            &self.client,
            installation_id,
            repository,
            PULL_REQUESTS_QUERY,
            cursor,
            page_size,
        )
        .await?;

        let (edges, nodes) = split_edges(connection::<PullRequestNode>(&repo, "/pullRequests")?);
        if nodes.is_empty() {
            return Ok(PageResult::empty());
        }

        let mut update = repository_update(&repo, repository);
        update.pull_requests = nodes
            .into_iter()
            .map(|node| PullRequestEntry {
                number: node.number,
                title: node.title,
                url: node.url,
                state: node.state,
                author: node.author.map(|author| author.login),
                source_branch: node.head_ref_name,
                destination_branch: node.base_ref_name,
                updated_at: node.updated_at,
            })
            .collect();

        Ok(PageResult {
            edges,
            payload: Some(update),
        })
    }
}

/// Branch heads with their latest commit
pub struct BranchTask {
    client: Arc<GitHubClient>,
}

impl BranchTask {
    pub fn new(client: Arc<GitHubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskHandler for BranchTask {
    async fn fetch_page(
        &self,
        installation_id: i64,
        repository: &RepositorySummary,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<PageResult, SourceError> {
        let repo = query_repository(
            &self.client,
            installation_id,
            repository,
            BRANCHES_QUERY,
            cursor,
            page_size,
        )
        .await?;

        let (edges, nodes) = split_edges(connection::<RefNode>(&repo, "/refs")?);
        if nodes.is_empty() {
            return Ok(PageResult::empty());
        }

        let mut update = repository_update(&repo, repository);
        update.branches = nodes
            .into_iter()
            .map(|node| BranchEntry {
                name: node.name,
                last_commit: node.target.map(Into::into),
            })
            .collect();

        Ok(PageResult {
            edges,
            payload: Some(update),
        })
    }
}

/// Default-branch commit history
pub struct CommitTask {
    client: Arc<GitHubClient>,
}

impl CommitTask {
    pub fn new(client: Arc<GitHubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskHandler for CommitTask {
    async fn fetch_page(
        &self,
        installation_id: i64,
        repository: &RepositorySummary,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<PageResult, SourceError> {
        let repo = query_repository(
            &self.client,
            installation_id,
            repository,
            COMMITS_QUERY,
            cursor,
            page_size,
        )
        .await?;

        // Empty repositories have no default branch
        let (edges, nodes) = split_edges(connection::<CommitNode>(
            &repo,
            "/defaultBranchRef/target/history",
        )?);
        if nodes.is_empty() {
            return Ok(PageResult::empty());
        }

        let mut update = repository_update(&repo, repository);
        update.commits = nodes.into_iter().map(Into::into).collect();

        Ok(PageResult {
            edges,
            payload: Some(update),
        })
    }
}
