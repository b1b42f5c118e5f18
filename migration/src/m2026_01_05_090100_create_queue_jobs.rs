//! Migration to create the queue_jobs table.
//!
//! Backs the named job queues (discovery, installation) with delayed delivery,
//! an attempts budget and a per-job removal policy.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueueJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(QueueJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(QueueJobs::Queue).text().not_null())
                    .col(ColumnDef::new(QueueJobs::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(QueueJobs::Status)
                            .text()
                            .not_null()
                            .default("waiting"),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::AttemptsMade)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::DelayMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::RunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::RemoveOnComplete)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::RemoveOnFail)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(QueueJobs::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(QueueJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueueJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim path scans waiting jobs of one queue ordered by run_at
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_queue_jobs_queue_status_run_at ON queue_jobs (queue, status, run_at)".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_queue_jobs_queue_status_run_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(QueueJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueueJobs {
    Table,
    Id,
    Queue,
    Payload,
    Status,
    Attempts,
    AttemptsMade,
    DelayMs,
    RunAt,
    RemoveOnComplete,
    RemoveOnFail,
    StartedAt,
    FinishedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
