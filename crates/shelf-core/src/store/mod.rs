//! Collaborator contracts for the external systems the engine talks to.
//!
//! Every method returns a [`StoreError`] so the [`RetryPolicy`](crate::RetryPolicy)
//! can tell transient failures from permanent ones.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Serialize;

use crate::document::{PersistedDocument, WriteOutcome};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::graph::model::{GraphFootprint, GraphNode, GraphRelationship, NodeKey, NodeLabel, RelationshipKey};
use crate::record::model::{Collection, DocumentId, SourceRecord};

pub type StoreResult<T> = Result<T, StoreError>;

/// Active/inactive document totals per collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentCounts {
    pub active: BTreeMap<Collection, usize>,
    pub inactive: BTreeMap<Collection, usize>,
    pub pending: usize,
}

/// Node totals per label and relationship totals per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub nodes: BTreeMap<String, usize>,
    pub relationships: BTreeMap<String, usize>,
}

/// Production document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &DocumentId) -> StoreResult<Option<PersistedDocument>>;

    /// Fingerprints of the active documents in a collection, by natural key.
    async fn fingerprints(&self, collection: Collection) -> StoreResult<HashMap<String, Fingerprint>>;

    async fn active_keys(&self, collection: Collection) -> StoreResult<BTreeSet<String>> {
        Ok(self.fingerprints(collection).await?.into_keys().collect())
    }

    /// Write content, fingerprint, liveness and graph refs as one atomic unit.
    ///
    /// `expected_revision` is the revision read beforehand (`0` when the
    /// document did not exist). The document is marked pending for the graph.
    async fn put(&self, doc: &PersistedDocument, expected_revision: u64) -> StoreResult<WriteOutcome>;

    /// Record what the graph now holds for a document and clear its pending
    /// mark. Returns `false`, writing nothing, when the document has moved
    /// on since the footprint was taken.
    async fn record_footprint(&self, id: &DocumentId, footprint: &GraphFootprint) -> StoreResult<bool>;

    /// Documents whose graph state is behind their content.
    async fn pending(&self) -> StoreResult<Vec<DocumentId>>;

    /// Active documents other than `excluding` that support a graph key,
    /// in id order.
    async fn supporters(&self, graph_key: &str, excluding: &DocumentId) -> StoreResult<Vec<DocumentId>>;

    async fn is_referenced(&self, graph_key: &str, excluding: &DocumentId) -> StoreResult<bool> {
        Ok(!self.supporters(graph_key, excluding).await?.is_empty())
    }

    async fn counts(&self) -> StoreResult<DocumentCounts>;
}

/// Property graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Declare a uniqueness constraint. Safe to repeat.
    async fn ensure_constraint(&self, label: NodeLabel, property: &str) -> StoreResult<()>;

    /// Create or update a node by key.
    ///
    /// An owned node ends up with exactly its given properties plus the key;
    /// an endpoint node keeps whatever properties it already has.
    async fn merge_node(&self, node: &GraphNode) -> StoreResult<()>;

    /// Create or update a relationship between existing nodes.
    ///
    /// Fails with [`StoreError::MissingEndpoint`] when either node is absent.
    async fn merge_relationship(&self, rel: &GraphRelationship) -> StoreResult<()>;

    async fn delete_relationship(&self, key: &RelationshipKey) -> StoreResult<()>;

    /// Remove a node together with any relationships still attached.
    async fn delete_node(&self, key: &NodeKey) -> StoreResult<()>;

    async fn counts(&self) -> StoreResult<GraphCounts>;
}

/// Asset store for images referenced by documents.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy `source_url` to `destination`, returning a stable reference URL.
    async fn put_from_url(&self, source_url: &str, destination: &str) -> StoreResult<String>;
}

/// A finite, restartable source of rows for one collection.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    fn collection(&self) -> Collection;

    /// Number of rows the source says it holds.
    async fn total_count(&self) -> StoreResult<usize>;

    async fn fetch(&self) -> StoreResult<Vec<SourceRecord>>;
}
