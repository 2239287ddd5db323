//! Graph Materializer.
//!
//! Brings the graph in line with one persisted document: merge every derived
//! node, then every derived relationship, then remove what the document used
//! to imply and nothing else supports, then record the new footprint.

use std::collections::BTreeSet;
use std::sync::Arc;

use shelf_core::{
    derive_graph, DerivedGraph, DocumentId, DocumentStore, ExternalSystem, GraphFootprint,
    GraphNode, GraphRelationship, GraphStore, NodeKey, NodeLabel, PersistedDocument,
    RelationshipKey, RetryPolicy, StoreError, SyncError, SyncResult,
};
use tracing::{debug, info};

use crate::locks::KeyedLocks;

/// Property every node label is made unique on.
pub const NODE_KEY_PROPERTY: &str = "key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// The footprint already matched; the graph was not touched.
    UpToDate,
    Synced { merged: usize, removed: usize },
    /// The document changed while its graph was being written. It stays
    /// pending for whoever wrote the newer state.
    Superseded,
}

pub struct GraphMaterializer {
    documents: Arc<dyn DocumentStore>,
    graph: Arc<dyn GraphStore>,
    locks: KeyedLocks,
    policy: RetryPolicy,
}

impl GraphMaterializer {
    pub fn new(documents: Arc<dyn DocumentStore>, graph: Arc<dyn GraphStore>, policy: RetryPolicy) -> Self {
        Self {
            documents,
            graph,
            locks: KeyedLocks::new(),
            policy,
        }
    }

    /// Declare the key constraint for every node label. Safe to repeat.
    pub async fn ensure_constraints(&self) -> SyncResult<()> {
        for label in NodeLabel::ALL {
            let graph = self.graph.clone();
            self.policy
                .call(ExternalSystem::GraphStore, "ensure_constraint", || {
                    let graph = graph.clone();
                    async move { graph.ensure_constraint(label, NODE_KEY_PROPERTY).await }
                })
                .await?;
        }
        info!(labels = NodeLabel::ALL.len(), "Graph constraints ensured");
        Ok(())
    }

    pub async fn materialize(&self, doc: &PersistedDocument) -> SyncResult<Materialized> {
        let id = doc.id();

        if !doc.is_pending() {
            // Clears a stale pending mark left by a write that restored
            // already-materialized content.
            if let Some(footprint) = &doc.footprint {
                self.record_footprint(&id, footprint).await?;
            }
            return Ok(Materialized::UpToDate);
        }

        let current = if doc.active {
            derive_graph(&doc.canonical())
        } else {
            DerivedGraph::default()
        };
        let implied = if doc.active {
            current.clone()
        } else {
            derive_graph(&doc.canonical())
        };
        let (previous_nodes, previous_relationships) = match &doc.footprint {
            Some(fp) => (fp.nodes.clone(), fp.relationships.clone()),
            // Never recorded: whatever the last content implied may be there.
            None if !doc.active => (implied.node_keys(), implied.relationship_keys()),
            None => (BTreeSet::new(), BTreeSet::new()),
        };
        let owned = implied.owned_node_keys();

        let mut merged = 0;
        for node in current.nodes.values() {
            self.merge_node(node).await?;
            merged += 1;
        }
        for rel in current.relationships.values() {
            self.merge_relationship(rel).await?;
            merged += 1;
        }

        let mut removed = 0;
        for key in previous_relationships.difference(&current.relationship_keys()) {
            if self.remove_relationship(key, &id).await? {
                removed += 1;
            }
        }
        for key in previous_nodes.difference(&current.node_keys()) {
            if self.remove_node(key, &id, owned.contains(key)).await? {
                removed += 1;
            }
        }

        let footprint = GraphFootprint::of(doc.fingerprint.clone(), doc.active, &current);
        if !self.record_footprint(&id, &footprint).await? {
            debug!(id = %id, "Document moved on during materialization");
            return Ok(Materialized::Superseded);
        }

        debug!(id = %id, merged, removed, "Graph materialized");
        Ok(Materialized::Synced { merged, removed })
    }

    async fn merge_node(&self, node: &GraphNode) -> SyncResult<()> {
        let _guard = self.locks.lock(&node.key.to_string()).await;
        self.write_node(node).await
    }

    async fn merge_relationship(&self, rel: &GraphRelationship) -> SyncResult<()> {
        let _guard = self.locks.lock(&rel.key.to_string()).await;
        self.write_relationship(rel).await
    }

    /// Delete a relationship nothing else supports. When another document
    /// still supports it, its properties are rewritten from that document.
    async fn remove_relationship(&self, key: &RelationshipKey, owner: &DocumentId) -> SyncResult<bool> {
        let graph_key = key.to_string();
        let _guard = self.locks.lock(&graph_key).await;
        let supporters = self.supporters(&graph_key, owner).await?;
        if !supporters.is_empty() {
            self.restore_relationship(key, &supporters).await?;
            return Ok(false);
        }
        let graph = self.graph.clone();
        self.policy
            .call(ExternalSystem::GraphStore, "delete_relationship", || {
                let graph = graph.clone();
                let key = key.clone();
                async move { graph.delete_relationship(&key).await }
            })
            .await?;
        Ok(true)
    }

    /// Caller holds the relationship's key lock.
    async fn restore_relationship(&self, key: &RelationshipKey, supporters: &[DocumentId]) -> SyncResult<()> {
        for id in supporters {
            let Some(doc) = self.get_document(id).await? else {
                continue;
            };
            if !doc.active {
                continue;
            }
            if let Some(rel) = derive_graph(&doc.canonical()).relationships.remove(key) {
                debug!(relationship = %key, supporter = %id, "Relationship still supported, restoring");
                return self.write_relationship(&rel).await;
            }
        }
        debug!(relationship = %key, "No supporter derives relationship, leaving as is");
        Ok(())
    }

    /// Delete a node nothing else supports. A node this document owned but
    /// others still point at is stripped back to its key.
    async fn remove_node(&self, key: &NodeKey, owner: &DocumentId, owned: bool) -> SyncResult<bool> {
        let graph_key = key.to_string();
        let _guard = self.locks.lock(&graph_key).await;
        if self.is_referenced(&graph_key, owner).await? {
            debug!(node = %graph_key, owned, "Node still supported, keeping");
            if owned {
                self.write_node(&GraphNode::owned(key.clone(), Default::default())).await?;
            }
            return Ok(false);
        }
        let graph = self.graph.clone();
        self.policy
            .call(ExternalSystem::GraphStore, "delete_node", || {
                let graph = graph.clone();
                let key = key.clone();
                async move { graph.delete_node(&key).await }
            })
            .await?;
        Ok(true)
    }

    async fn write_node(&self, node: &GraphNode) -> SyncResult<()> {
        let graph = self.graph.clone();
        self.policy
            .call(ExternalSystem::GraphStore, "merge_node", || {
                let graph = graph.clone();
                let node = node.clone();
                async move { graph.merge_node(&node).await }
            })
            .await
    }

    async fn write_relationship(&self, rel: &GraphRelationship) -> SyncResult<()> {
        let graph = self.graph.clone();
        let result = self
            .policy
            .call(ExternalSystem::GraphStore, "merge_relationship", || {
                let graph = graph.clone();
                let rel = rel.clone();
                async move { graph.merge_relationship(&rel).await }
            })
            .await;
        match result {
            Err(SyncError::ExternalSystemRejected {
                error: StoreError::MissingEndpoint(endpoint),
                ..
            }) => Err(SyncError::ReferentialIntegrityViolation {
                relationship: rel.key.to_string(),
                detail: format!("endpoint {} does not exist", endpoint),
            }),
            other => other,
        }
    }

    async fn get_document(&self, id: &DocumentId) -> SyncResult<Option<PersistedDocument>> {
        let documents = self.documents.clone();
        self.policy
            .call(ExternalSystem::DocumentStore, "get", || {
                let documents = documents.clone();
                let id = id.clone();
                async move { documents.get(&id).await }
            })
            .await
    }

    async fn supporters(&self, graph_key: &str, owner: &DocumentId) -> SyncResult<Vec<DocumentId>> {
        let documents = self.documents.clone();
        self.policy
            .call(ExternalSystem::DocumentStore, "supporters", || {
                let documents = documents.clone();
                let graph_key = graph_key.to_string();
                let owner = owner.clone();
                async move { documents.supporters(&graph_key, &owner).await }
            })
            .await
    }

    async fn is_referenced(&self, graph_key: &str, owner: &DocumentId) -> SyncResult<bool> {
        let documents = self.documents.clone();
        self.policy
            .call(ExternalSystem::DocumentStore, "is_referenced", || {
                let documents = documents.clone();
                let graph_key = graph_key.to_string();
                let owner = owner.clone();
                async move { documents.is_referenced(&graph_key, &owner).await }
            })
            .await
    }

    async fn record_footprint(&self, id: &DocumentId, footprint: &GraphFootprint) -> SyncResult<bool> {
        let documents = self.documents.clone();
        self.policy
            .call(ExternalSystem::DocumentStore, "record_footprint", || {
                let documents = documents.clone();
                let id = id.clone();
                let footprint = footprint.clone();
                async move { documents.record_footprint(&id, &footprint).await }
            })
            .await
    }
}
