//! Migration to create the installations table.
//!
//! Each row links a source-host installation to a destination tenant and carries
//! the durable per-repository sync progress as JSON.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Installations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Installations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Installations::InstallationId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Installations::TenantId).text().not_null())
                    .col(
                        ColumnDef::new(Installations::SyncStatus)
                            .text()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(
                        ColumnDef::new(Installations::RepoSyncState)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Installations::SyncedRepoCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Installations::TotalRepoCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Installations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Installations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_installations_installation_tenant")
                    .table(Installations::Table)
                    .col(Installations::InstallationId)
                    .col(Installations::TenantId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_installations_installation_tenant")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Installations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Installations {
    Table,
    Id,
    InstallationId,
    TenantId,
    SyncStatus,
    RepoSyncState,
    SyncedRepoCount,
    TotalRepoCount,
    CreatedAt,
    UpdatedAt,
}
