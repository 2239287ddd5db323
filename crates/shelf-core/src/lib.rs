//! # Shelf Core
//!
//! Domain model and pure logic for the Shelf sync engine.
//!
//! Source rows are normalized into typed documents, fingerprinted, compared
//! against the fingerprints held by the production document store, and mapped
//! onto a property graph through a declarative table. Everything that talks to
//! an external system goes through the traits in [`store`] and the
//! [`RetryPolicy`] in [`resilience`].

pub mod config;
pub mod delta;
pub mod document;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod record;
pub mod report;
pub mod resilience;
pub mod store;

pub use config::{ConfigError, Neo4jConfig, RedisConfig, RetryConfig, ShelfConfig, SyncConfig};
pub use delta::model::{
    BatchGuard, DeltaEntry, DeltaKind, DeltaSet, DuplicatePolicy, StagedBatch, StagedRecord,
};
pub use delta::{classify, detect, stage, StagingOutcome};
pub use document::{PersistedDocument, WriteOutcome};
pub use error::{ExternalSystem, StoreError, SyncError, SyncResult};
pub use fingerprint::Fingerprint;
pub use graph::model::{
    DerivedGraph, GraphFootprint, GraphNode, GraphRelationship, NodeKey, NodeLabel, RelType,
    RelationshipKey,
};
pub use graph::derive_graph;
pub use record::model::{CanonicalDocument, Collection, DocumentId, FieldValue, SourceRecord};
pub use record::normalize;
pub use report::{CollectionStats, Issue, IssueKind, Phase, RunOutcome, RunReport};
pub use resilience::{Backoff, RetryPolicy};
pub use store::{
    BlobStore, DocumentCounts, DocumentStore, GraphCounts, GraphStore, SourceFeed, StoreResult,
};
