//! # repo-sync Library
//!
//! Incremental synchronization of source-host installations (pull requests,
//! branches, commits per repository) into a destination service, driven by
//! a durable job queue.

pub mod config;
pub mod db;
pub mod destination;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod handlers;
pub mod models;
pub mod progress;
pub mod queue;
pub mod repositories;
pub mod server;
pub mod source;
pub mod sync_engine;
pub mod tasks;
pub mod telemetry;
pub mod worker;
pub use migration;
