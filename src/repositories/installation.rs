//! # Installation Repository
//!
//! SeaORM-backed [`ProgressStore`] for the installations table. The JSON
//! `repo_sync_state` column is decoded into a typed [`RepoSyncState`] on load
//! and written back wholesale on save.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::*;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::installation::{ActiveModel, Column, Entity, Model};
use crate::progress::{
    InstallationKey, InstallationProgress, ProgressStore, RepoSyncState, StoreError, SyncStatus,
};

/// Repository for installation progress
#[derive(Clone)]
pub struct InstallationRepository {
    db: DatabaseConnection,
}

impl InstallationRepository {
    /// Create a new InstallationRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Link a new installation in PENDING state with no repositories.
    pub async fn create(&self, key: &InstallationKey) -> Result<InstallationProgress, StoreError> {
        let now = Utc::now().fixed_offset();
        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            installation_id: Set(key.installation_id),
            tenant_id: Set(key.tenant_id.clone()),
            sync_status: Set(SyncStatus::Pending.as_str().to_string()),
            repo_sync_state: Set(None),
            synced_repo_count: Set(0),
            total_repo_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        info!(
            installation_id = key.installation_id,
            tenant_id = %key.tenant_id,
            "Installation linked"
        );

        to_progress(model)
    }

    async fn find_model(&self, key: &InstallationKey) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::InstallationId.eq(key.installation_id))
            .filter(Column::TenantId.eq(key.tenant_id.clone()))
            .one(&self.db)
            .await
    }
}

#[async_trait]
impl ProgressStore for InstallationRepository {
    async fn load(&self, key: &InstallationKey) -> Result<Option<InstallationProgress>, StoreError> {
        match self.find_model(key).await? {
            Some(model) => to_progress(model).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, progress: &InstallationProgress) -> Result<bool, StoreError> {
        let key = &progress.key;
        let state_json = serde_json::to_value(&progress.repo_sync_state).map_err(|source| {
            StoreError::CorruptState {
                key: key.to_string(),
                source,
            }
        })?;

        let result = Entity::update_many()
            .col_expr(
                Column::SyncStatus,
                Expr::value(progress.sync_status.as_str().to_string()),
            )
            .col_expr(Column::RepoSyncState, Expr::value(state_json))
            .col_expr(
                Column::SyncedRepoCount,
                Expr::value(progress.synced_repo_count as i32),
            )
            .col_expr(
                Column::TotalRepoCount,
                Expr::value(progress.total_repo_count as i32),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::InstallationId.eq(key.installation_id))
            .filter(Column::TenantId.eq(key.tenant_id.clone()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            debug!(installation = %key, "Installation vanished before save");
            return Ok(false);
        }

        Ok(true)
    }

    async fn set_sync_status(
        &self,
        key: &InstallationKey,
        status: SyncStatus,
    ) -> Result<bool, StoreError> {
        let result = Entity::update_many()
            .col_expr(Column::SyncStatus, Expr::value(status.as_str().to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::InstallationId.eq(key.installation_id))
            .filter(Column::TenantId.eq(key.tenant_id.clone()))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}

fn to_progress(model: Model) -> Result<InstallationProgress, StoreError> {
    let key = InstallationKey::new(model.installation_id, model.tenant_id);

    let sync_status: SyncStatus = model.sync_status.parse().map_err(|_| StoreError::InvalidStatus {
        key: key.to_string(),
        value: model.sync_status.clone(),
    })?;

    let repo_sync_state = match model.repo_sync_state {
        Some(value) if !value.is_null() => {
            serde_json::from_value::<RepoSyncState>(value).map_err(|source| {
                StoreError::CorruptState {
                    key: key.to_string(),
                    source,
                }
            })?
        }
        _ => RepoSyncState::new(),
    };

    let updated_at: DateTime<Utc> = model.updated_at.with_timezone(&Utc);

    Ok(InstallationProgress {
        key,
        sync_status,
        repo_sync_state,
        synced_repo_count: model.synced_repo_count.max(0) as u32,
        total_repo_count: model.total_repo_count.max(0) as u32,
        updated_at,
    })
}
