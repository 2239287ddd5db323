//! Staging and delta models.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::record::model::{CanonicalDocument, Collection, DocumentId};

/// A normalized document plus its fingerprint, alive for one comparison pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    pub document: CanonicalDocument,
    pub fingerprint: Fingerprint,
}

impl StagedRecord {
    pub fn new(document: CanonicalDocument) -> Self {
        let fingerprint = Fingerprint::of(&document);
        Self {
            document,
            fingerprint,
        }
    }

    pub fn key(&self) -> &str {
        &self.document.key
    }
}

/// Caller-owned staging area for one collection in one run.
///
/// `records` keeps the order keys were first seen in. `held` keys are
/// neither written nor considered for deletion during this run.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub collection: Collection,
    pub source_count: usize,
    pub records: Vec<StagedRecord>,
    pub held: BTreeSet<String>,
    index: HashMap<String, usize>,
}

impl StagedBatch {
    pub fn new(collection: Collection, source_count: usize) -> Self {
        Self {
            collection,
            source_count,
            records: Vec::new(),
            held: BTreeSet::new(),
            index: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&StagedRecord> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows that carried a readable key, held or not.
    pub fn keyed_count(&self) -> usize {
        self.records.len() + self.held.len()
    }

    pub(crate) fn insert(&mut self, record: StagedRecord) {
        match self.index.get(record.key()) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.key().to_string(), self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Drop staged records for held keys.
    pub(crate) fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = &self.held;
        self.records.retain(|r| !held.contains(r.key()));
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key().to_string(), i))
            .collect();
    }
}

/// Resolution rule for a natural key seen twice in one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    LastSeenWins,
    FirstSeenWins,
    /// Hold the key: nothing is written or deleted for it this run.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Created,
    Updated,
    Unchanged,
    Deleted,
}

/// Outcome of comparing one key against the stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEntry {
    Created(StagedRecord),
    Updated {
        record: StagedRecord,
        previous: Fingerprint,
    },
    Unchanged {
        id: DocumentId,
    },
    Deleted {
        id: DocumentId,
        previous: Fingerprint,
    },
}

impl DeltaEntry {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Self::Created(_) => DeltaKind::Created,
            Self::Updated { .. } => DeltaKind::Updated,
            Self::Unchanged { .. } => DeltaKind::Unchanged,
            Self::Deleted { .. } => DeltaKind::Deleted,
        }
    }

    pub fn id(&self) -> DocumentId {
        match self {
            Self::Created(record) | Self::Updated { record, .. } => record.document.id(),
            Self::Unchanged { id } | Self::Deleted { id, .. } => id.clone(),
        }
    }

    /// The incoming record, for Created and Updated entries.
    pub fn staged(&self) -> Option<&StagedRecord> {
        match self {
            Self::Created(record) | Self::Updated { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Forwardable deltas for one collection. Unchanged keys are only counted.
#[derive(Debug, Clone)]
pub struct DeltaSet {
    pub collection: Collection,
    pub entries: Vec<DeltaEntry>,
    pub unchanged: usize,
}

impl DeltaSet {
    pub fn count(&self, kind: DeltaKind) -> usize {
        if kind == DeltaKind::Unchanged {
            return self.unchanged;
        }
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Minimum number of keyed rows a batch must carry before deletions are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchGuard {
    pub min_batch_size: usize,
}
