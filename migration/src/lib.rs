//! Database migrations for the repo-sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_installations;
mod m2026_01_05_090100_create_queue_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_installations::Migration),
            Box::new(m2026_01_05_090100_create_queue_jobs::Migration),
        ]
    }
}
