//! Centralized error types for Shelf.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::record::model::Collection;
use crate::report::IssueKind;

/// External systems the engine calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSystem {
    DocumentStore,
    GraphStore,
    SourceFeed,
    BlobStore,
}

impl ExternalSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentStore => "document_store",
            Self::GraphStore => "graph_store",
            Self::SourceFeed => "source_feed",
            Self::BlobStore => "blob_store",
        }
    }
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a single call into an external system.
///
/// The variant decides whether the [`RetryPolicy`](crate::RetryPolicy)
/// tries again: see [`StoreError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("relationship endpoint missing: {0}")]
    MissingEndpoint(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited(_) | Self::Unavailable(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors produced while running a sync.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("schema violation in {collection} record {}: field '{field}' {reason}", .key.as_deref().unwrap_or("<no key>"))]
    SchemaViolation {
        collection: Collection,
        key: Option<String>,
        field: String,
        reason: String,
    },

    #[error("duplicate key '{key}' in {collection} batch ({occurrences} occurrences)")]
    DuplicateKeyConflict {
        collection: Collection,
        key: String,
        occurrences: usize,
    },

    #[error("suspicious batch for {collection}: {received} records received, floor is {floor}")]
    SuspiciousEmptyBatch {
        collection: Collection,
        received: usize,
        floor: usize,
    },

    #[error("incomplete feed for {collection}: expected {expected} records, received {received}")]
    IncompleteFeed {
        collection: Collection,
        expected: usize,
        received: usize,
    },

    #[error("{system} unavailable after {attempts} attempts ({operation}): {last_error}")]
    ExternalSystemUnavailable {
        system: ExternalSystem,
        operation: String,
        attempts: u32,
        last_error: StoreError,
    },

    #[error("{system} rejected {operation}: {error}")]
    ExternalSystemRejected {
        system: ExternalSystem,
        operation: String,
        error: StoreError,
    },

    #[error("referential integrity violation on {relationship}: {detail}")]
    ReferentialIntegrityViolation { relationship: String, detail: String },

    #[error("optimistic write for {id} lost {attempts} times in a row")]
    WriteContention { id: String, attempts: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Errors that must stop the whole run rather than a single record.
    pub fn is_systemic(&self) -> bool {
        match self {
            Self::SuspiciousEmptyBatch { .. } | Self::Cancelled | Self::Config(_) => true,
            Self::ExternalSystemUnavailable { system, .. }
            | Self::ExternalSystemRejected { system, .. } => {
                *system == ExternalSystem::DocumentStore
            }
            _ => false,
        }
    }

    /// The external system behind this error, if any.
    pub fn system(&self) -> Option<ExternalSystem> {
        match self {
            Self::ExternalSystemUnavailable { system, .. }
            | Self::ExternalSystemRejected { system, .. } => Some(*system),
            _ => None,
        }
    }

    pub fn kind(&self) -> IssueKind {
        match self {
            Self::SchemaViolation { .. } => IssueKind::SchemaViolation,
            Self::DuplicateKeyConflict { .. } => IssueKind::DuplicateKeyConflict,
            Self::SuspiciousEmptyBatch { .. } => IssueKind::SuspiciousEmptyBatch,
            Self::IncompleteFeed { .. } => IssueKind::IncompleteFeed,
            Self::ExternalSystemUnavailable { .. } => IssueKind::ExternalSystemUnavailable,
            Self::ExternalSystemRejected { .. } => IssueKind::ExternalSystemRejected,
            Self::ReferentialIntegrityViolation { .. } => IssueKind::ReferentialIntegrityViolation,
            Self::WriteContention { .. } => IssueKind::WriteContention,
            Self::Cancelled => IssueKind::Cancelled,
            Self::Config(_) => IssueKind::Config,
        }
    }

    /// Collection named by the error itself, when it carries one.
    pub fn collection(&self) -> Option<Collection> {
        match self {
            Self::SchemaViolation { collection, .. }
            | Self::DuplicateKeyConflict { collection, .. }
            | Self::SuspiciousEmptyBatch { collection, .. }
            | Self::IncompleteFeed { collection, .. } => Some(*collection),
            _ => None,
        }
    }

    /// Natural key named by the error itself, when it carries one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::SchemaViolation { key, .. } => key.as_deref(),
            Self::DuplicateKeyConflict { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StoreError::Timeout("t".into()).is_retryable());
        assert!(StoreError::Connection("reset".into()).is_retryable());
        assert!(StoreError::RateLimited("429".into()).is_retryable());
        assert!(!StoreError::Auth("bad password".into()).is_retryable());
        assert!(!StoreError::Constraint("unique".into()).is_retryable());
        assert!(!StoreError::MissingEndpoint("Club:c1".into()).is_retryable());
    }

    #[test]
    fn document_store_outage_is_systemic() {
        let err = SyncError::ExternalSystemUnavailable {
            system: ExternalSystem::DocumentStore,
            operation: "put".into(),
            attempts: 3,
            last_error: StoreError::Connection("refused".into()),
        };
        assert!(err.is_systemic());

        let graph = SyncError::ExternalSystemUnavailable {
            system: ExternalSystem::GraphStore,
            operation: "merge_node".into(),
            attempts: 3,
            last_error: StoreError::Connection("refused".into()),
        };
        assert!(!graph.is_systemic());
        assert_eq!(graph.system(), Some(ExternalSystem::GraphStore));
    }

    #[test]
    fn schema_violation_message_names_missing_key() {
        let err = SyncError::SchemaViolation {
            collection: Collection::Members,
            key: None,
            field: "member_id".into(),
            reason: "is required".into(),
        };
        assert_eq!(
            err.to_string(),
            "schema violation in members record <no key>: field 'member_id' is required"
        );
    }
}
