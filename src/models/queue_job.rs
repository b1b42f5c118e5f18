//! QueueJob entity model
//!
//! This module contains the SeaORM entity model for the queue_jobs table, the
//! durable backing store of the named job queues.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// QueueJob entity representing one scheduled delivery of a job payload
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "queue_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Logical queue name (e.g., discovery, installation)
    pub queue: String,

    /// Serialized job data
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Current status (waiting, active, completed, failed)
    pub status: String,

    /// Total attempts allowed for this job
    pub attempts: i32,

    /// Attempts that have already failed
    pub attempts_made: i32,

    /// Delay requested at enqueue time in milliseconds
    pub delay_ms: i64,

    /// Timestamp when the job becomes eligible for delivery
    pub run_at: DateTimeWithTimeZone,

    /// Delete the row once the job succeeds
    pub remove_on_complete: bool,

    /// Delete the row once the job exhausts its attempts
    pub remove_on_fail: bool,

    /// Timestamp when the current delivery started
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached a terminal status
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Structured details of the most recent failure
    #[sea_orm(column_type = "JsonBinary")]
    pub last_error: Option<JsonValue>,

    /// Timestamp when the job was enqueued
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
