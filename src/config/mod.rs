//! Configuration loading for the repo-sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `REPO_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::github::DEFAULT_GITHUB_API_BASE;

const ENV_PREFIX: &str = "REPO_SYNC_";

/// Application configuration derived from `REPO_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    #[serde(default = "default_destination_api_base")]
    pub destination_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_api_token: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Scheduling knobs of the installation sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EngineConfig {
    /// Delay before the next page of an unfinished task (default: 1000)
    ///
    /// Environment variable: `REPO_SYNC_ENGINE_INTER_JOB_DELAY_MS`
    #[serde(default = "default_inter_job_delay_ms")]
    pub inter_job_delay_ms: u64,

    /// Retry delay after a network timeout (default: 5000)
    ///
    /// Environment variable: `REPO_SYNC_ENGINE_NETWORK_TIMEOUT_RETRY_DELAY_MS`
    #[serde(default = "default_network_timeout_retry_delay_ms")]
    pub network_timeout_retry_delay_ms: u64,

    /// Retry delay after an abuse / secondary rate limit signal (default: 60000)
    ///
    /// Environment variable: `REPO_SYNC_ENGINE_ABUSE_RETRY_DELAY_MS`
    #[serde(default = "default_abuse_retry_delay_ms")]
    pub abuse_retry_delay_ms: u64,

    /// Attempts budget of follow-up jobs while work remains (default: 3)
    ///
    /// Environment variable: `REPO_SYNC_ENGINE_CONTINUATION_ATTEMPTS`
    #[serde(default = "default_continuation_attempts")]
    pub continuation_attempts: u32,

    /// Attempts budget of jobs re-enqueued after a recoverable failure (default: 1)
    ///
    /// Environment variable: `REPO_SYNC_ENGINE_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

/// Queue worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct QueueConfig {
    /// Milliseconds between polls of a queue (default: 500)
    #[serde(default = "default_queue_tick_ms")]
    pub tick_ms: u64,
    /// Maximum jobs claimed per poll (default: 20)
    #[serde(default = "default_queue_claim_batch")]
    pub claim_batch: u64,
    /// Concurrent discovery jobs (default: 2)
    #[serde(default = "default_discovery_concurrency")]
    pub discovery_concurrency: usize,
    /// Concurrent installation-sync jobs (default: 8)
    #[serde(default = "default_installation_concurrency")]
    pub installation_concurrency: usize,
    /// Base backoff between failed deliveries of a job (default: 5000)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Attempts budget of externally triggered jobs (default: 3)
    #[serde(default = "default_queue_attempts")]
    pub default_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            github_api_base: default_github_api_base(),
            github_token: None,
            destination_api_base: default_destination_api_base(),
            destination_api_token: None,
            engine: EngineConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inter_job_delay_ms: default_inter_job_delay_ms(),
            network_timeout_retry_delay_ms: default_network_timeout_retry_delay_ms(),
            abuse_retry_delay_ms: default_abuse_retry_delay_ms(),
            continuation_attempts: default_continuation_attempts(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_queue_tick_ms(),
            claim_batch: default_queue_claim_batch(),
            discovery_concurrency: default_discovery_concurrency(),
            installation_concurrency: default_installation_concurrency(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_attempts: default_queue_attempts(),
        }
    }
}

/// Longest delay any engine knob may request (1 hour)
const MAX_ENGINE_DELAY_MS: u64 = 3_600_000;

impl EngineConfig {
    /// Validate engine configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("inter job delay", self.inter_job_delay_ms),
            (
                "network timeout retry delay",
                self.network_timeout_retry_delay_ms,
            ),
            ("abuse retry delay", self.abuse_retry_delay_ms),
        ] {
            if value > MAX_ENGINE_DELAY_MS {
                return Err(ConfigError::InvalidEngineDelay {
                    field: field.to_string(),
                    value,
                });
            }
        }

        if self.continuation_attempts == 0 || self.continuation_attempts > 20 {
            return Err(ConfigError::InvalidAttempts {
                field: "engine continuation attempts".to_string(),
                value: self.continuation_attempts,
            });
        }

        if self.retry_attempts == 0 || self.retry_attempts > 20 {
            return Err(ConfigError::InvalidAttempts {
                field: "engine retry attempts".to_string(),
                value: self.retry_attempts,
            });
        }

        Ok(())
    }
}

impl QueueConfig {
    /// Validate queue worker configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms < 50 || self.tick_ms > 60_000 {
            return Err(ConfigError::InvalidQueueTick {
                value: self.tick_ms,
            });
        }

        if self.claim_batch == 0 {
            return Err(ConfigError::InvalidClaimBatch);
        }

        for (queue, value) in [
            ("discovery", self.discovery_concurrency),
            ("installation-sync", self.installation_concurrency),
        ] {
            if value == 0 || value > 256 {
                return Err(ConfigError::InvalidConcurrency {
                    queue: queue.to_string(),
                    value,
                });
            }
        }

        if self.retry_backoff_ms == 0 {
            return Err(ConfigError::InvalidRetryBackoff);
        }

        if self.default_attempts == 0 || self.default_attempts > 20 {
            return Err(ConfigError::InvalidAttempts {
                field: "queue default attempts".to_string(),
                value: self.default_attempts,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.github_token.is_some() {
            config.github_token = Some("[REDACTED]".to_string());
        }
        if config.destination_api_token.is_some() {
            config.destination_api_token = Some("[REDACTED]".to_string());
        }
        if let Ok(mut url) = url::Url::parse(&config.database_url)
            && url.password().is_some()
            && url.set_password(Some("[REDACTED]")).is_ok()
        {
            config.database_url = url.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A source token is only optional for local development and tests
        if !matches!(self.profile.as_str(), "local" | "test") && self.github_token.is_none() {
            return Err(ConfigError::MissingGitHubToken);
        }

        for (field, value) in [
            ("GITHUB_API_BASE", &self.github_api_base),
            ("DESTINATION_API_BASE", &self.destination_api_base),
        ] {
            if let Err(source) = url::Url::parse(value) {
                return Err(ConfigError::InvalidUrl {
                    field: field.to_string(),
                    value: value.clone(),
                    source,
                });
            }
        }

        self.engine.validate()?;
        self.queue.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/repo_sync".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_github_api_base() -> String {
    DEFAULT_GITHUB_API_BASE.to_string()
}

fn default_destination_api_base() -> String {
    "http://localhost:8090".to_string()
}

fn default_inter_job_delay_ms() -> u64 {
    1000
}

fn default_network_timeout_retry_delay_ms() -> u64 {
    5000
}

fn default_abuse_retry_delay_ms() -> u64 {
    60_000
}

fn default_continuation_attempts() -> u32 {
    3
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_queue_tick_ms() -> u64 {
    500
}

fn default_queue_claim_batch() -> u64 {
    20
}

fn default_discovery_concurrency() -> usize {
    2
}

fn default_installation_concurrency() -> usize {
    8
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_queue_attempts() -> u32 {
    3
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("GitHub token is missing; set REPO_SYNC_GITHUB_TOKEN environment variable")]
    MissingGitHubToken,
    #[error("{field} must be a valid URL, got '{value}': {source}")]
    InvalidUrl {
        field: String,
        value: String,
        source: url::ParseError,
    },
    #[error("{field} must not exceed 3600000 ms, got {value}")]
    InvalidEngineDelay { field: String, value: u64 },
    #[error("{field} must be between 1 and 20, got {value}")]
    InvalidAttempts { field: String, value: u32 },
    #[error("queue tick must be between 50 and 60000 ms, got {value}")]
    InvalidQueueTick { value: u64 },
    #[error("queue claim batch must be positive")]
    InvalidClaimBatch,
    #[error("{queue} queue concurrency must be between 1 and 256, got {value}")]
    InvalidConcurrency { queue: String, value: usize },
    #[error("queue retry backoff must be positive")]
    InvalidRetryBackoff,
}

/// Loads configuration using layered `.env` files and `REPO_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.<profile>`, `.env.<profile>.local`, then
    /// the process environment, later sources winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let github_api_base =
            take_string(&mut layered, "GITHUB_API_BASE").unwrap_or_else(default_github_api_base);
        let github_token = take_string(&mut layered, "GITHUB_TOKEN");
        let destination_api_base = take_string(&mut layered, "DESTINATION_API_BASE")
            .unwrap_or_else(default_destination_api_base);
        let destination_api_token = take_string(&mut layered, "DESTINATION_API_TOKEN");

        let engine = EngineConfig {
            inter_job_delay_ms: take_parsed(&mut layered, "ENGINE_INTER_JOB_DELAY_MS")?
                .unwrap_or_else(default_inter_job_delay_ms),
            network_timeout_retry_delay_ms: take_parsed(
                &mut layered,
                "ENGINE_NETWORK_TIMEOUT_RETRY_DELAY_MS",
            )?
            .unwrap_or_else(default_network_timeout_retry_delay_ms),
            abuse_retry_delay_ms: take_parsed(&mut layered, "ENGINE_ABUSE_RETRY_DELAY_MS")?
                .unwrap_or_else(default_abuse_retry_delay_ms),
            continuation_attempts: take_parsed(&mut layered, "ENGINE_CONTINUATION_ATTEMPTS")?
                .unwrap_or_else(default_continuation_attempts),
            retry_attempts: take_parsed(&mut layered, "ENGINE_RETRY_ATTEMPTS")?
                .unwrap_or_else(default_retry_attempts),
        };

        let queue = QueueConfig {
            tick_ms: take_parsed(&mut layered, "QUEUE_TICK_MS")?
                .unwrap_or_else(default_queue_tick_ms),
            claim_batch: take_parsed(&mut layered, "QUEUE_CLAIM_BATCH")?
                .unwrap_or_else(default_queue_claim_batch),
            discovery_concurrency: take_parsed(&mut layered, "QUEUE_DISCOVERY_CONCURRENCY")?
                .unwrap_or_else(default_discovery_concurrency),
            installation_concurrency: take_parsed(&mut layered, "QUEUE_INSTALLATION_CONCURRENCY")?
                .unwrap_or_else(default_installation_concurrency),
            retry_backoff_ms: take_parsed(&mut layered, "QUEUE_RETRY_BACKOFF_MS")?
                .unwrap_or_else(default_retry_backoff_ms),
            default_attempts: take_parsed(&mut layered, "QUEUE_DEFAULT_ATTEMPTS")?
                .unwrap_or_else(default_queue_attempts),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            github_api_base,
            github_token,
            destination_api_base,
            destination_api_token,
            engine,
            queue,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{}PROFILE", ENV_PREFIX))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a non-blank value.
fn take_string(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Remove and parse a value; blank counts as unset.
fn take_parsed<T: std::str::FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(values, key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{}{}", ENV_PREFIX, key),
                value,
            }),
    }
}
