//! # Installation API Handlers
//!
//! Read-only progress view of an installation and the endpoint that starts a
//! sync by enqueueing a discovery job.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::error::{ApiError, ErrorType, validation_error};
use crate::progress::{InstallationKey, InstallationProgress, ProgressStore, SyncStatus, TaskStatus};
use crate::queue::{InstallationJobData, JobOptions, JobQueue, QueueName, SyncType};
use crate::server::AppState;

/// Progress of one task type for a repository
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressView {
    /// Task type name
    #[schema(example = "branch")]
    pub task: String,
    pub status: TaskStatus,
    /// Resume position of the task, absent until the first page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Progress of one repository
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryProgressView {
    #[schema(example = 101)]
    pub repository_id: i64,
    #[schema(example = "acme/widgets")]
    pub full_name: String,
    pub synced: bool,
    pub tasks: Vec<TaskProgressView>,
}

/// Sync progress of an installation
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatusResponse {
    #[schema(example = 42)]
    pub installation_id: i64,
    #[schema(example = "acme")]
    pub tenant_id: String,
    pub sync_status: SyncStatus,
    pub synced_repo_count: u32,
    pub total_repo_count: u32,
    pub updated_at: DateTime<Utc>,
    pub repositories: Vec<RepositoryProgressView>,
}

impl From<InstallationProgress> for InstallationStatusResponse {
    fn from(progress: InstallationProgress) -> Self {
        let repositories = progress
            .repo_sync_state
            .ordered()
            .into_iter()
            .map(|repo| RepositoryProgressView {
                repository_id: repo.repository.id,
                full_name: repo.repository.full_name.clone(),
                synced: repo.is_synced(),
                tasks: repo
                    .tasks
                    .iter()
                    .map(|(task, task_progress)| TaskProgressView {
                        task: task.to_string(),
                        status: task_progress.status,
                        cursor: task_progress.cursor.clone(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            installation_id: progress.key.installation_id,
            tenant_id: progress.key.tenant_id,
            sync_status: progress.sync_status,
            synced_repo_count: progress.synced_repo_count,
            total_repo_count: progress.total_repo_count,
            updated_at: progress.updated_at,
            repositories,
        }
    }
}

/// Request payload for starting a sync
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// `full` resets every task, `partial` resumes (default)
    #[serde(default)]
    pub sync_type: Option<SyncType>,
}

/// Response payload for an accepted sync request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncAcceptedResponse {
    /// Id of the enqueued discovery job
    pub job_id: String,
    pub sync_type: SyncType,
    /// Whether the installation was linked by this request
    pub created: bool,
}

/// Get the sync progress of an installation
#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/installations/{installation_id}",
    params(
        ("tenant_id" = String, Path, description = "Destination tenant id"),
        ("installation_id" = i64, Path, description = "Installation id on the source host")
    ),
    responses(
        (status = 200, description = "Installation progress", body = InstallationStatusResponse),
        (status = 404, description = "Installation not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "installations"
)]
pub async fn get_installation(
    State(state): State<AppState>,
    Path((tenant_id, installation_id)): Path<(String, i64)>,
) -> Result<Json<InstallationStatusResponse>, ApiError> {
    let key = InstallationKey::new(installation_id, tenant_id);
    let progress = state
        .installations
        .load(&key)
        .await?
        .ok_or_else(|| ApiError::from(ErrorType::NotFound))?;

    Ok(Json(progress.into()))
}

/// Start a sync of an installation
///
/// Links the installation when it is not known yet, then enqueues a
/// discovery job that refreshes the repository list and kicks off the sync.
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/installations/{installation_id}/sync",
    params(
        ("tenant_id" = String, Path, description = "Destination tenant id"),
        ("installation_id" = i64, Path, description = "Installation id on the source host")
    ),
    request_body(content = SyncRequest, description = "Optional sync type", content_type = "application/json"),
    responses(
        (status = 202, description = "Discovery job enqueued", body = SyncAcceptedResponse),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "installations"
)]
pub async fn start_sync(
    State(state): State<AppState>,
    Path((tenant_id, installation_id)): Path<(String, i64)>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SyncAcceptedResponse>), ApiError> {
    // A bodiless POST asks for a partial sync.
    let request = match body {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => SyncRequest::default(),
        Err(rejection) => return Err(rejection.into()),
    };

    if tenant_id.trim().is_empty() {
        return Err(validation_error(
            "Tenant id cannot be empty",
            serde_json::json!({ "field": "tenant_id" }),
        ));
    }

    let key = InstallationKey::new(installation_id, tenant_id);
    let created = match state.installations.load(&key).await? {
        Some(_) => false,
        None => {
            state.installations.create(&key).await?;
            true
        }
    };

    let sync_type = request.sync_type.unwrap_or_default();
    let data = InstallationJobData {
        sync_type: Some(sync_type),
        ..InstallationJobData::new(key.installation_id, key.tenant_id.clone())
    };
    let opts = JobOptions {
        attempts: state.config.queue.default_attempts,
        ..JobOptions::default()
    };
    let job_id = state.queue.enqueue(QueueName::Discovery, data, opts).await?;

    info!(
        installation = %key,
        %job_id,
        ?sync_type,
        created,
        "Sync requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAcceptedResponse {
            job_id: job_id.to_string(),
            sync_type,
            created,
        }),
    ))
}
