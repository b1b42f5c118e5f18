//! Installation entity model
//!
//! This module contains the SeaORM entity model for the installations table,
//! which links a source-host installation to a destination tenant and stores
//! the durable sync progress for every repository of that installation.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Installation entity representing one tenant's source/destination linkage
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "installations")]
pub struct Model {
    /// Unique identifier for the row (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Installation identifier on the source host
    pub installation_id: i64,

    /// Destination tenant identifier
    pub tenant_id: String,

    /// Overall sync status (PENDING, ACTIVE, COMPLETE, FAILED)
    pub sync_status: String,

    /// Per-repository task progress, keyed by repository id
    #[sea_orm(column_type = "JsonBinary")]
    pub repo_sync_state: Option<JsonValue>,

    /// Number of repositories with every task complete
    pub synced_repo_count: i32,

    /// Number of repositories known for this installation
    pub total_repo_count: i32,

    /// Timestamp when the installation was linked
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the installation was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
