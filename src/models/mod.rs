//! # Data Models
//!
//! This module contains the SeaORM entities and the small API payloads used
//! throughout the repo-sync service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod installation;
pub mod queue_job;

pub use installation::Entity as Installation;
pub use queue_job::Entity as QueueJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "repo-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
