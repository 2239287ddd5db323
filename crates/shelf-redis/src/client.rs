//! Redis connection pool management.

use redis::aio::ConnectionManager;
use redis::ErrorKind;
use shelf_core::StoreError;
use thiserror::Error;

/// Redis error types.
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt document {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type for Redis operations.
pub type RedisResult<T> = Result<T, RedisError>;

/// Redis connection pool. ConnectionManager multiplexes and reconnects
/// internally; it is Clone, so callers clone it per operation.
pub type RedisPool = ConnectionManager;

/// Initialize a Redis connection pool from a URL.
///
/// Example URL: `redis://127.0.0.1:6379`
pub async fn init_pool(redis_url: &str) -> RedisResult<RedisPool> {
    let client = redis::Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;
    Ok(manager)
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err {
            RedisError::Connection(e) => classify(&e),
            RedisError::Serialization(e) => StoreError::Serialization(e.to_string()),
            RedisError::Corrupt { .. } => StoreError::Invalid(err.to_string()),
        }
    }
}

/// Map a driver error onto the retry taxonomy.
pub fn classify(err: &redis::RedisError) -> StoreError {
    let message = err.to_string();
    if err.is_timeout() {
        return StoreError::Timeout(message);
    }
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        return StoreError::Connection(message);
    }
    if matches!(err.code(), Some("NOAUTH" | "WRONGPASS" | "NOPERM")) {
        return StoreError::Auth(message);
    }
    match err.kind() {
        ErrorKind::BusyLoadingError
        | ErrorKind::TryAgain
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown => StoreError::Unavailable(message),
        ErrorKind::AuthenticationFailed => StoreError::Auth(message),
        ErrorKind::TypeError | ErrorKind::ParseError => StoreError::Serialization(message),
        ErrorKind::InvalidClientConfig => StoreError::Invalid(message),
        _ => StoreError::Other(message),
    }
}
