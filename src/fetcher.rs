//! Page fetching with page-size fallback
//!
//! The source host rejects some pages as too expensive (node or resource
//! limits). Those requests are retried at progressively smaller page sizes;
//! every other failure is returned to the caller untouched.

use thiserror::Error;
use tracing::{debug, warn};

use crate::progress::RepositorySummary;
use crate::source::SourceError;
use crate::tasks::{PageResult, TaskHandler, TaskType};

/// Page sizes tried in order, largest first
pub const PAGE_SIZES: [u32; 4] = [20, 10, 5, 1];

/// Failure of a fetch with fallback
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("{task} page for repository {repository_id} exceeded capacity at every page size")]
    FallbackExhausted {
        task: TaskType,
        repository_id: i64,
        last: SourceError,
    },
}

impl FetchError {
    /// Source error behind this failure, if the source host raised one
    pub fn source_error(&self) -> &SourceError {
        match self {
            FetchError::Source(err) => err,
            FetchError::FallbackExhausted { last, .. } => last,
        }
    }
}

/// Fetch one page of `task`, degrading the page size on capacity errors.
pub async fn fetch_with_fallback(
    handler: &dyn TaskHandler,
    task: TaskType,
    installation_id: i64,
    repository: &RepositorySummary,
    cursor: Option<&str>,
) -> Result<PageResult, FetchError> {
    let mut last_error = None;

    for page_size in PAGE_SIZES {
        match handler
            .fetch_page(installation_id, repository, cursor, page_size)
            .await
        {
            Ok(page) => {
                debug!(
                    installation_id,
                    repository_id = repository.id,
                    task = %task,
                    page_size,
                    edges = page.edges.len(),
                    "Fetched page"
                );
                return Ok(page);
            }
            Err(err) if err.is_capacity_exceeded() => {
                warn!(
                    installation_id,
                    repository_id = repository.id,
                    task = %task,
                    page_size,
                    error = %err,
                    "Page exceeded source capacity, retrying smaller"
                );
                last_error = Some(err);
            }
            Err(err) => return Err(FetchError::Source(err)),
        }
    }

    Err(FetchError::FallbackExhausted {
        task,
        repository_id: repository.id,
        last: last_error.unwrap_or_else(|| SourceError::new("no page size attempted")),
    })
}
