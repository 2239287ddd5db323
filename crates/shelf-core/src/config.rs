//! Runtime configuration.
//!
//! Loaded from an optional TOML file, then overridden from the environment,
//! which is where connection credentials come from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::model::{BatchGuard, DuplicatePolicy};
use crate::record::model::Collection;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShelfConfig {
    pub redis: RedisConfig,
    pub neo4j: Neo4jConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix for every key the document store writes.
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "shelf".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    pub max_connections: usize,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Keys processed concurrently.
    pub workers: usize,
    /// Keys per batch; cancellation is checked between batches.
    pub batch_size: usize,
    /// Empty-batch guard floor for collections without an override.
    pub min_batch_size: usize,
    /// Per-collection floors, keyed by collection name.
    pub min_batch_overrides: BTreeMap<String, usize>,
    pub duplicate_policy: DuplicatePolicy,
    /// Optimistic-concurrency retries per key before giving up.
    pub conflict_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: 100,
            min_batch_size: 1,
            min_batch_overrides: BTreeMap::new(),
            duplicate_policy: DuplicatePolicy::default(),
            conflict_retries: 5,
        }
    }
}

impl SyncConfig {
    pub fn guard_for(&self, collection: Collection) -> BatchGuard {
        BatchGuard {
            min_batch_size: self
                .min_batch_overrides
                .get(collection.as_str())
                .copied()
                .unwrap_or(self.min_batch_size),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    /// `0` disables the per-attempt timeout.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
            attempt_timeout_ms: 15_000,
        }
    }
}

impl ShelfConfig {
    /// Load from `path` (defaults when `None`), apply the process
    /// environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("SHELF_REDIS_URL").or_else(|| non_empty("REDIS_URL")) {
            self.redis.url = url;
        }
        if let Some(uri) = non_empty("NEO4J_URI") {
            self.neo4j.uri = uri;
        }
        if let Some(user) = non_empty("NEO4J_USERNAME") {
            self.neo4j.user = user;
        }
        if let Some(password) = non_empty("NEO4J_PASSWORD") {
            self.neo4j.password = password;
        }
        if let Some(workers) = non_empty("SHELF_WORKERS") {
            self.sync.workers = workers.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("SHELF_WORKERS must be a positive integer, got '{}'", workers))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.sync.workers == 0 {
            return invalid("sync.workers must be at least 1");
        }
        if self.sync.batch_size == 0 {
            return invalid("sync.batch_size must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.redis.namespace.trim().is_empty() {
            return invalid("redis.namespace must not be empty");
        }
        for name in self.sync.min_batch_overrides.keys() {
            name.parse::<Collection>().map_err(|e| {
                ConfigError::Invalid(format!("sync.min_batch_overrides: {}", e))
            })?;
        }
        Ok(())
    }
}
