//! In-memory collaborators for tests and dry runs.
//!
//! Each store can be told to fail: [`Faults::set_down`] makes every call
//! fail with a retryable error, [`Faults::fail_next`] scripts one failure for
//! a named operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::document::{PersistedDocument, WriteOutcome};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::graph::model::{
    GraphFootprint, GraphNode, GraphRelationship, NodeKey, NodeLabel, RelationshipKey,
};
use crate::record::model::{Collection, DocumentId, FieldValue, SourceRecord};

use super::{
    BlobStore, DocumentCounts, DocumentStore, GraphCounts, GraphStore, SourceFeed, StoreResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure injection shared by the in-memory stores.
#[derive(Debug, Default)]
pub struct Faults {
    down: AtomicBool,
    scripted: Mutex<Vec<(&'static str, StoreError)>>,
    calls: AtomicUsize,
}

impl Faults {
    /// Fail every call with [`StoreError::Unavailable`] until reset.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next call to `operation` (`"*"` for any) with `error`.
    pub fn fail_next(&self, operation: &'static str, error: StoreError) {
        lock(&self.scripted).push((operation, error));
    }

    /// Calls attempted so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is down", operation)));
        }
        let mut scripted = lock(&self.scripted);
        match scripted
            .iter()
            .position(|(op, _)| *op == "*" || *op == operation)
        {
            Some(i) => Err(scripted.remove(i).1),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct DocState {
    docs: BTreeMap<DocumentId, PersistedDocument>,
    refs: HashMap<String, BTreeSet<DocumentId>>,
    pending: BTreeSet<DocumentId>,
    contention: HashMap<DocumentId, u32>,
}

/// Document store keeping everything in a single locked map.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<DocState>,
    faults: Faults,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Current stored state of a document.
    pub fn document(&self, id: &DocumentId) -> Option<PersistedDocument> {
        lock(&self.state).docs.get(id).cloned()
    }

    pub fn documents(&self) -> Vec<PersistedDocument> {
        lock(&self.state).docs.values().cloned().collect()
    }

    /// Simulate another writer touching `id` before the next `times` writes.
    pub fn contend(&self, id: &DocumentId, times: u32) {
        lock(&self.state).contention.insert(id.clone(), times);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: &DocumentId) -> StoreResult<Option<PersistedDocument>> {
        self.faults.check("get")?;
        Ok(lock(&self.state).docs.get(id).cloned())
    }

    async fn fingerprints(&self, collection: Collection) -> StoreResult<HashMap<String, Fingerprint>> {
        self.faults.check("fingerprints")?;
        Ok(lock(&self.state)
            .docs
            .values()
            .filter(|d| d.collection == collection && d.active)
            .map(|d| (d.key.clone(), d.fingerprint.clone()))
            .collect())
    }

    async fn put(&self, doc: &PersistedDocument, expected_revision: u64) -> StoreResult<WriteOutcome> {
        self.faults.check("put")?;
        let mut state = lock(&self.state);
        let state = &mut *state;
        let id = doc.id();

        if let Some(remaining) = state.contention.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                if let Some(stored) = state.docs.get_mut(&id) {
                    stored.revision += 1;
                }
                return Ok(WriteOutcome::Conflict);
            }
        }

        let (stored_revision, footprint) = match state.docs.get(&id) {
            Some(stored) => (stored.revision, stored.footprint.clone()),
            None => (0, None),
        };
        if stored_revision != expected_revision {
            return Ok(WriteOutcome::Conflict);
        }

        if let Some(stored) = state.docs.get(&id) {
            for key in &stored.refs {
                if let Some(ids) = state.refs.get_mut(key) {
                    ids.remove(&id);
                }
            }
        }
        for key in &doc.refs {
            state.refs.entry(key.clone()).or_default().insert(id.clone());
        }

        let revision = stored_revision + 1;
        let mut stored = doc.clone();
        stored.revision = revision;
        stored.footprint = footprint;
        state.docs.insert(id.clone(), stored);
        state.pending.insert(id);
        Ok(WriteOutcome::Written { revision })
    }

    async fn record_footprint(&self, id: &DocumentId, footprint: &GraphFootprint) -> StoreResult<bool> {
        self.faults.check("record_footprint")?;
        let mut state = lock(&self.state);
        let state = &mut *state;
        match state.docs.get_mut(id) {
            Some(doc) if doc.matches(footprint) => {
                doc.footprint = Some(footprint.clone());
                state.pending.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending(&self) -> StoreResult<Vec<DocumentId>> {
        self.faults.check("pending")?;
        Ok(lock(&self.state).pending.iter().cloned().collect())
    }

    async fn supporters(&self, graph_key: &str, excluding: &DocumentId) -> StoreResult<Vec<DocumentId>> {
        self.faults.check("supporters")?;
        Ok(lock(&self.state)
            .refs
            .get(graph_key)
            .map(|ids| ids.iter().filter(|id| *id != excluding).cloned().collect())
            .unwrap_or_default())
    }

    async fn counts(&self) -> StoreResult<DocumentCounts> {
        self.faults.check("counts")?;
        let state = lock(&self.state);
        let mut counts = DocumentCounts {
            pending: state.pending.len(),
            ..DocumentCounts::default()
        };
        for doc in state.docs.values() {
            let bucket = if doc.active {
                &mut counts.active
            } else {
                &mut counts.inactive
            };
            *bucket.entry(doc.collection).or_default() += 1;
        }
        Ok(counts)
    }
}

type Properties = BTreeMap<String, FieldValue>;

#[derive(Debug, Default)]
struct GraphState {
    constraints: BTreeSet<(NodeLabel, String)>,
    nodes: BTreeMap<NodeKey, Properties>,
    relationships: BTreeMap<RelationshipKey, Properties>,
}

/// Graph store with merge semantics matching the bolt implementation.
///
/// Merges are refused for labels without a declared key constraint.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: Mutex<GraphState>,
    writes: AtomicUsize,
    faults: Faults,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Successful merges and deletes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn node(&self, key: &NodeKey) -> Option<Properties> {
        lock(&self.state).nodes.get(key).cloned()
    }

    pub fn relationship(&self, key: &RelationshipKey) -> Option<Properties> {
        lock(&self.state).relationships.get(key).cloned()
    }

    pub fn node_keys(&self) -> Vec<NodeKey> {
        lock(&self.state).nodes.keys().cloned().collect()
    }

    pub fn relationship_keys(&self) -> Vec<RelationshipKey> {
        lock(&self.state).relationships.keys().cloned().collect()
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ensure_constraint(&self, label: NodeLabel, property: &str) -> StoreResult<()> {
        self.faults.check("ensure_constraint")?;
        lock(&self.state)
            .constraints
            .insert((label, property.to_string()));
        Ok(())
    }

    async fn merge_node(&self, node: &GraphNode) -> StoreResult<()> {
        self.faults.check("merge_node")?;
        let mut state = lock(&self.state);
        if !state
            .constraints
            .contains(&(node.key.label, "key".to_string()))
        {
            return Err(StoreError::Constraint(format!(
                "no key constraint declared for {}",
                node.key.label
            )));
        }
        let properties = state.nodes.entry(node.key.clone()).or_default();
        if node.owned {
            *properties = node.properties.clone();
        } else {
            properties.extend(node.properties.clone());
        }
        drop(state);
        self.wrote();
        Ok(())
    }

    async fn merge_relationship(&self, rel: &GraphRelationship) -> StoreResult<()> {
        self.faults.check("merge_relationship")?;
        let mut state = lock(&self.state);
        for endpoint in [&rel.key.from, &rel.key.to] {
            if !state.nodes.contains_key(endpoint) {
                return Err(StoreError::MissingEndpoint(endpoint.to_string()));
            }
        }
        state
            .relationships
            .insert(rel.key.clone(), rel.properties.clone());
        drop(state);
        self.wrote();
        Ok(())
    }

    async fn delete_relationship(&self, key: &RelationshipKey) -> StoreResult<()> {
        self.faults.check("delete_relationship")?;
        if lock(&self.state).relationships.remove(key).is_some() {
            self.wrote();
        }
        Ok(())
    }

    async fn delete_node(&self, key: &NodeKey) -> StoreResult<()> {
        self.faults.check("delete_node")?;
        let mut state = lock(&self.state);
        if state.nodes.remove(key).is_some() {
            state
                .relationships
                .retain(|rel, _| rel.from != *key && rel.to != *key);
            drop(state);
            self.wrote();
        }
        Ok(())
    }

    async fn counts(&self) -> StoreResult<GraphCounts> {
        self.faults.check("counts")?;
        let state = lock(&self.state);
        let mut counts = GraphCounts::default();
        for key in state.nodes.keys() {
            *counts.nodes.entry(key.label.to_string()).or_default() += 1;
        }
        for key in state.relationships.keys() {
            *counts
                .relationships
                .entry(key.rel_type.to_string())
                .or_default() += 1;
        }
        Ok(counts)
    }
}

/// Blob store that records copies instead of transferring bytes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, String>>,
    faults: Faults,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Destination key to source URL for every stored object.
    pub fn objects(&self) -> BTreeMap<String, String> {
        lock(&self.objects).clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_from_url(&self, source_url: &str, destination: &str) -> StoreResult<String> {
        self.faults.check("put_from_url")?;
        lock(&self.objects).insert(destination.to_string(), source_url.to_string());
        Ok(format!("memory://{}", destination))
    }
}

/// Feed over a fixed set of rows.
#[derive(Debug)]
pub struct StaticFeed {
    collection: Collection,
    records: Vec<SourceRecord>,
    reported_count: Option<usize>,
    faults: Faults,
}

impl StaticFeed {
    pub fn new(collection: Collection, records: Vec<SourceRecord>) -> Self {
        Self {
            collection,
            records,
            reported_count: None,
            faults: Faults::default(),
        }
    }

    /// Build from JSON objects; non-object values are skipped.
    pub fn from_values(collection: Collection, values: Vec<serde_json::Value>) -> Self {
        Self::new(
            collection,
            values.into_iter().filter_map(SourceRecord::from_json).collect(),
        )
    }

    /// Claim a total different from the rows actually served.
    pub fn with_reported_count(mut self, count: usize) -> Self {
        self.reported_count = Some(count);
        self
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl SourceFeed for StaticFeed {
    fn collection(&self) -> Collection {
        self.collection
    }

    async fn total_count(&self) -> StoreResult<usize> {
        self.faults.check("total_count")?;
        Ok(self.reported_count.unwrap_or(self.records.len()))
    }

    async fn fetch(&self) -> StoreResult<Vec<SourceRecord>> {
        self.faults.check("fetch")?;
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::RelType;
    use std::collections::BTreeMap;

    fn doc(key: &str, refs: &[&str]) -> PersistedDocument {
        PersistedDocument {
            collection: Collection::Memberships,
            key: key.to_string(),
            content: BTreeMap::new(),
            volatile: BTreeMap::new(),
            fingerprint: Fingerprint::from_hex(&"a".repeat(64)).unwrap(),
            active: true,
            revision: 0,
            refs: refs.iter().map(|r| r.to_string()).collect(),
            synced_at: chrono::Utc::now(),
            deleted_at: None,
            footprint: None,
        }
    }

    #[tokio::test]
    async fn put_is_compare_and_set_on_revision() {
        let store = MemoryDocumentStore::new();
        let d = doc("ms1", &["Member:m1"]);
        assert_eq!(store.put(&d, 0).await.unwrap(), WriteOutcome::Written { revision: 1 });
        assert_eq!(store.put(&d, 0).await.unwrap(), WriteOutcome::Conflict);
        assert_eq!(store.put(&d, 1).await.unwrap(), WriteOutcome::Written { revision: 2 });
        assert_eq!(store.pending().await.unwrap(), vec![d.id()]);
    }

    #[tokio::test]
    async fn refs_follow_the_latest_write() {
        let store = MemoryDocumentStore::new();
        let a = doc("a", &["Member:m1"]);
        let b = doc("b", &["Member:m1"]);
        store.put(&a, 0).await.unwrap();
        store.put(&b, 0).await.unwrap();
        assert!(store.is_referenced("Member:m1", &a.id()).await.unwrap());

        store.put(&b.deactivated(), 1).await.unwrap();
        assert!(!store.is_referenced("Member:m1", &a.id()).await.unwrap());
        assert!(store.is_referenced("Member:m1", &b.id()).await.unwrap());
        assert_eq!(store.fingerprints(Collection::Memberships).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_footprint_is_refused() {
        let store = MemoryDocumentStore::new();
        let d = doc("ms1", &[]);
        store.put(&d, 0).await.unwrap();
        let stale = GraphFootprint {
            fingerprint: Fingerprint::from_hex(&"b".repeat(64)).unwrap(),
            active: true,
            nodes: BTreeSet::new(),
            relationships: BTreeSet::new(),
        };
        assert!(!store.record_footprint(&d.id(), &stale).await.unwrap());
        let current = GraphFootprint {
            fingerprint: d.fingerprint.clone(),
            ..stale
        };
        assert!(store.record_footprint(&d.id(), &current).await.unwrap());
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn graph_requires_constraints_and_endpoints() {
        let graph = MemoryGraphStore::new();
        let member = GraphNode::endpoint(NodeKey::new(NodeLabel::Member, "m1"));
        assert!(matches!(
            graph.merge_node(&member).await,
            Err(StoreError::Constraint(_))
        ));

        graph.ensure_constraint(NodeLabel::Member, "key").await.unwrap();
        graph.merge_node(&member).await.unwrap();
        let rel = GraphRelationship {
            key: RelationshipKey {
                from: member.key.clone(),
                rel_type: RelType::MemberOfClub,
                to: NodeKey::new(NodeLabel::Club, "c1"),
            },
            properties: BTreeMap::new(),
        };
        assert!(matches!(
            graph.merge_relationship(&rel).await,
            Err(StoreError::MissingEndpoint(_))
        ));
        assert_eq!(graph.writes(), 1);
    }

    #[tokio::test]
    async fn owned_merges_replace_and_endpoint_merges_keep() {
        let graph = MemoryGraphStore::new();
        graph.ensure_constraint(NodeLabel::Member, "key").await.unwrap();
        let key = NodeKey::new(NodeLabel::Member, "m1");
        let props = |pairs: &[(&str, &str)]| -> Properties {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
                .collect()
        };

        graph
            .merge_node(&GraphNode::owned(key.clone(), props(&[("handle", "ada"), ("country", "PT")])))
            .await
            .unwrap();
        graph.merge_node(&GraphNode::endpoint(key.clone())).await.unwrap();
        assert_eq!(graph.node(&key).unwrap().len(), 2);

        graph
            .merge_node(&GraphNode::owned(key.clone(), props(&[("handle", "ada")])))
            .await
            .unwrap();
        assert_eq!(graph.node(&key).unwrap(), props(&[("handle", "ada")]));
    }

    #[tokio::test]
    async fn supporters_exclude_the_asking_document() {
        let store = MemoryDocumentStore::new();
        let a = doc("a", &["Member:m1"]);
        let b = doc("b", &["Member:m1"]);
        store.put(&a, 0).await.unwrap();
        store.put(&b, 0).await.unwrap();

        assert_eq!(store.supporters("Member:m1", &a.id()).await.unwrap(), vec![b.id()]);
        assert!(store.supporters("Club:c1", &a.id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scripted_faults_fire_once() {
        let feed = StaticFeed::from_values(Collection::Members, vec![serde_json::json!({"member_id": "m1"})]);
        feed.faults().fail_next("fetch", StoreError::Timeout("slow".into()));
        assert!(feed.fetch().await.is_err());
        assert_eq!(feed.fetch().await.unwrap().len(), 1);
        assert_eq!(feed.faults().calls(), 2);
    }
}
