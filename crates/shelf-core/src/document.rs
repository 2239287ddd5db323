//! Persisted document model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::model::StagedRecord;
use crate::fingerprint::Fingerprint;
use crate::graph::derive_graph;
use crate::graph::model::GraphFootprint;
use crate::record::model::{CanonicalDocument, Collection, DocumentId, FieldValue};

/// Production representation of a document.
///
/// Content, fingerprint, `active` and `refs` are always written together.
/// `footprint` records what the graph holds for this document and is
/// written separately, after materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub collection: Collection,
    pub key: String,
    pub content: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub volatile: BTreeMap<String, FieldValue>,
    pub fingerprint: Fingerprint,
    pub active: bool,
    /// Optimistic-concurrency token, bumped on every write.
    pub revision: u64,
    /// Graph keys the current content supports; empty once inactive.
    #[serde(default)]
    pub refs: Vec<String>,
    pub synced_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footprint: Option<GraphFootprint>,
}

impl PersistedDocument {
    /// Active document for a staged record, carrying the graph keys it implies.
    ///
    /// `revision` and `footprint` are left for the store to manage.
    pub fn from_staged(record: &StagedRecord) -> Self {
        let document = &record.document;
        Self {
            collection: document.collection,
            key: document.key.clone(),
            content: document.content.clone(),
            volatile: document.volatile.clone(),
            fingerprint: record.fingerprint.clone(),
            active: true,
            revision: 0,
            refs: derive_graph(document).refs(),
            synced_at: Utc::now(),
            deleted_at: None,
            footprint: None,
        }
    }

    /// Soft-deleted copy: last-known content is kept, support for graph keys is dropped.
    pub fn deactivated(&self) -> Self {
        let now = Utc::now();
        Self {
            active: false,
            refs: Vec::new(),
            synced_at: now,
            deleted_at: Some(now),
            ..self.clone()
        }
    }

    pub fn id(&self) -> DocumentId {
        DocumentId::new(self.collection, self.key.clone())
    }

    pub fn canonical(&self) -> CanonicalDocument {
        CanonicalDocument {
            collection: self.collection,
            key: self.key.clone(),
            content: self.content.clone(),
            volatile: self.volatile.clone(),
        }
    }

    /// Same content, fingerprint and liveness as `other`.
    pub fn converged_with(&self, other: &PersistedDocument) -> bool {
        self.active == other.active
            && self.fingerprint == other.fingerprint
            && self.content == other.content
    }

    /// The graph does not yet reflect this document's current state.
    pub fn is_pending(&self) -> bool {
        match &self.footprint {
            None => true,
            Some(fp) => {
                fp.active != self.active
                    || fp.fingerprint != self.fingerprint
                    || (!self.active && !fp.is_empty())
            }
        }
    }

    /// Whether `footprint` was taken from this document's current state.
    pub fn matches(&self, footprint: &GraphFootprint) -> bool {
        footprint.active == self.active && footprint.fingerprint == self.fingerprint
    }
}

/// Result of a conditional document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { revision: u64 },
    /// The stored revision moved since it was read.
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::DerivedGraph;

    fn staged() -> StagedRecord {
        StagedRecord::new(CanonicalDocument {
            collection: Collection::Memberships,
            key: "m1-c1".into(),
            content: BTreeMap::from([
                ("member_id".to_string(), FieldValue::from("m1")),
                ("club_id".to_string(), FieldValue::from("c1")),
            ]),
            volatile: BTreeMap::new(),
        })
    }

    #[test]
    fn from_staged_records_graph_refs() {
        let doc = PersistedDocument::from_staged(&staged());
        assert!(doc.active);
        assert_eq!(doc.refs.len(), 3);
        assert!(doc.refs.contains(&"Member:m1".to_string()));
        assert!(doc.is_pending());
    }

    #[test]
    fn deactivated_drops_refs_but_keeps_content() {
        let doc = PersistedDocument::from_staged(&staged());
        let gone = doc.deactivated();
        assert!(!gone.active);
        assert!(gone.refs.is_empty());
        assert_eq!(gone.content, doc.content);
        assert!(gone.deleted_at.is_some());
        assert!(gone.is_pending());
    }

    #[test]
    fn pending_tracks_footprint_fingerprint() {
        let mut doc = PersistedDocument::from_staged(&staged());
        let graph = derive_graph(&doc.canonical());
        doc.footprint = Some(GraphFootprint::of(doc.fingerprint.clone(), true, &graph));
        assert!(!doc.is_pending());

        let mut gone = doc.deactivated();
        assert!(gone.is_pending());
        let cleaned = GraphFootprint::of(gone.fingerprint.clone(), false, &DerivedGraph::default());
        assert!(gone.matches(&cleaned));
        gone.footprint = Some(cleaned.clone());
        assert!(!gone.is_pending());

        let mut revived = gone.clone();
        revived.active = true;
        assert!(!revived.matches(&cleaned));
        assert!(revived.is_pending());
    }
}
