//! Staging and Delta Detector.

pub mod model;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::fingerprint::Fingerprint;
use crate::record::model::{Collection, DocumentId, SourceRecord};
use crate::record::normalize;
use model::{BatchGuard, DeltaEntry, DeltaSet, DuplicatePolicy, StagedBatch, StagedRecord};

/// A staged batch plus the per-record problems found while building it.
#[derive(Debug)]
pub struct StagingOutcome {
    pub batch: StagedBatch,
    pub issues: Vec<SyncError>,
}

/// Normalize and fingerprint a collection's rows into a fresh staging area.
///
/// Rows failing the schema are reported; when their key is readable the key
/// is held. Duplicate keys are resolved by `policy` and each duplicated key
/// is reported once.
pub fn stage(
    collection: Collection,
    records: Vec<SourceRecord>,
    source_count: usize,
    policy: DuplicatePolicy,
) -> StagingOutcome {
    let mut batch = StagedBatch::new(collection, source_count);
    let mut issues = Vec::new();
    let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();

    for record in &records {
        let document = match normalize(collection, record) {
            Ok(document) => document,
            Err(err) => {
                if let Some(key) = err.key() {
                    batch.held.insert(key.to_string());
                }
                warn!(collection = %collection, error = %err, "Skipping record");
                issues.push(err);
                continue;
            }
        };

        let seen = occurrences.entry(document.key.clone()).or_insert(0);
        *seen += 1;
        if *seen == 1 {
            batch.insert(StagedRecord::new(document));
            continue;
        }

        match policy {
            DuplicatePolicy::LastSeenWins => batch.insert(StagedRecord::new(document)),
            DuplicatePolicy::FirstSeenWins => {}
            DuplicatePolicy::Reject => {
                batch.held.insert(document.key);
            }
        }
    }

    for (key, count) in occurrences.into_iter().filter(|(_, n)| *n > 1) {
        warn!(collection = %collection, key = %key, occurrences = count, policy = ?policy, "Duplicate key in batch");
        issues.push(SyncError::DuplicateKeyConflict {
            collection,
            key,
            occurrences: count,
        });
    }

    batch.release_held();
    debug!(
        collection = %collection,
        staged = batch.len(),
        held = batch.held.len(),
        "Staged batch"
    );

    StagingOutcome { batch, issues }
}

/// Classify one staged record against the stored fingerprint for its key.
pub fn classify(record: &StagedRecord, previous: Option<&Fingerprint>) -> DeltaEntry {
    match previous {
        None => DeltaEntry::Created(record.clone()),
        Some(prev) if *prev == record.fingerprint => DeltaEntry::Unchanged {
            id: record.document.id(),
        },
        Some(prev) => DeltaEntry::Updated {
            record: record.clone(),
            previous: prev.clone(),
        },
    }
}

/// Compare a staged batch with the active fingerprints in the document store.
///
/// Fails with [`SyncError::SuspiciousEmptyBatch`] before producing anything
/// when the batch carries fewer keyed rows than the guard floor. Deleted
/// entries are emitted after all others, ordered by key.
pub fn detect(
    batch: &StagedBatch,
    previous: &HashMap<String, Fingerprint>,
    guard: BatchGuard,
) -> SyncResult<DeltaSet> {
    let received = batch.keyed_count();
    if received < guard.min_batch_size {
        return Err(SyncError::SuspiciousEmptyBatch {
            collection: batch.collection,
            received,
            floor: guard.min_batch_size,
        });
    }

    let mut entries = Vec::new();
    let mut unchanged = 0;
    for record in &batch.records {
        match classify(record, previous.get(record.key())) {
            DeltaEntry::Unchanged { .. } => unchanged += 1,
            entry => entries.push(entry),
        }
    }

    let mut removed: Vec<(&String, &Fingerprint)> = previous
        .iter()
        .filter(|(key, _)| !batch.contains(key) && !batch.held.contains(key.as_str()))
        .collect();
    removed.sort_by(|a, b| a.0.cmp(b.0));
    entries.extend(removed.into_iter().map(|(key, fp)| DeltaEntry::Deleted {
        id: DocumentId::new(batch.collection, key.clone()),
        previous: fp.clone(),
    }));

    Ok(DeltaSet {
        collection: batch.collection,
        entries,
        unchanged,
    })
}
