//! Document Sync Engine.
//!
//! Applies one [`DeltaEntry`] to the document store. Each key is handled as
//! a read-compare-write cycle guarded by the stored revision; when another
//! writer got there first the whole cycle is repeated.

use std::sync::Arc;

use shelf_core::{
    DeltaEntry, DocumentId, DocumentStore, ExternalSystem, PersistedDocument, RetryPolicy,
    SyncError, SyncResult, WriteOutcome,
};
use tracing::{debug, warn};

/// What the store holds for a key once an entry has been applied.
#[derive(Debug, Clone)]
pub struct Applied {
    pub document: PersistedDocument,
    /// False when the store already held the desired state.
    pub written: bool,
}

pub struct DocumentSync {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
    conflict_retries: u32,
}

impl DocumentSync {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy, conflict_retries: u32) -> Self {
        Self {
            store,
            policy,
            conflict_retries,
        }
    }

    /// Make the store reflect `entry`.
    ///
    /// Returns `None` only for a deletion of a key the store never held.
    /// Replaying an entry is a no-op once the store has converged.
    pub async fn apply(&self, entry: &DeltaEntry) -> SyncResult<Option<Applied>> {
        let id = entry.id();
        let desired = entry.staged().map(PersistedDocument::from_staged);

        let attempts = self.conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let stored = self.get(&id).await?;
            let target = match (&desired, &stored) {
                (Some(desired), _) => desired.clone(),
                (None, Some(stored)) => stored.deactivated(),
                (None, None) => return Ok(None),
            };

            if let Some(stored) = &stored {
                if stored.converged_with(&target) {
                    debug!(id = %id, "Document already converged");
                    return Ok(Some(Applied {
                        document: stored.clone(),
                        written: false,
                    }));
                }
            }

            let expected = stored.as_ref().map_or(0, |s| s.revision);
            let store = self.store.clone();
            let outcome = self
                .policy
                .call(ExternalSystem::DocumentStore, "put", || {
                    let store = store.clone();
                    let target = target.clone();
                    async move { store.put(&target, expected).await }
                })
                .await?;

            match outcome {
                WriteOutcome::Written { revision } => {
                    let mut document = target;
                    document.revision = revision;
                    document.footprint = stored.and_then(|s| s.footprint);
                    debug!(id = %id, revision, active = document.active, "Document written");
                    return Ok(Some(Applied {
                        document,
                        written: true,
                    }));
                }
                WriteOutcome::Conflict => {
                    warn!(id = %id, attempt, expected_revision = expected, "Concurrent write, retrying key");
                }
            }
        }

        Err(SyncError::WriteContention {
            id: id.to_string(),
            attempts,
        })
    }

    pub async fn get(&self, id: &DocumentId) -> SyncResult<Option<PersistedDocument>> {
        let store = self.store.clone();
        self.policy
            .call(ExternalSystem::DocumentStore, "get", || {
                let store = store.clone();
                let id = id.clone();
                async move { store.get(&id).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::store::memory::MemoryDocumentStore;
    use shelf_core::{normalize, Collection, SourceRecord, StagedRecord, StoreError};

    fn membership(rating: i64) -> StagedRecord {
        let record = SourceRecord::from_json(serde_json::json!({
            "membership_id": "ms1",
            "member_id": "m1",
            "club_id": "c1",
            "rating": rating,
        }))
        .unwrap();
        StagedRecord::new(normalize(Collection::Memberships, &record).unwrap())
    }

    fn sync(store: &Arc<MemoryDocumentStore>) -> DocumentSync {
        DocumentSync::new(store.clone(), RetryPolicy::immediate(3), 5)
    }

    #[tokio::test]
    async fn replaying_an_entry_converges() {
        let store = Arc::new(MemoryDocumentStore::new());
        let sync = sync(&store);
        let entry = DeltaEntry::Created(membership(4));

        let first = sync.apply(&entry).await.unwrap().unwrap();
        assert!(first.written);
        let after_once = store.document(&entry.id()).unwrap();

        let second = sync.apply(&entry).await.unwrap().unwrap();
        assert!(!second.written);
        assert_eq!(store.document(&entry.id()).unwrap(), after_once);
    }

    #[tokio::test]
    async fn update_replaces_content_and_fingerprint() {
        let store = Arc::new(MemoryDocumentStore::new());
        let sync = sync(&store);
        let created = DeltaEntry::Created(membership(4));
        sync.apply(&created).await.unwrap();
        let before = store.document(&created.id()).unwrap();

        let record = membership(5);
        let updated = DeltaEntry::Updated {
            previous: before.fingerprint.clone(),
            record: record.clone(),
        };
        let applied = sync.apply(&updated).await.unwrap().unwrap();

        let stored = store.document(&updated.id()).unwrap();
        assert_eq!(stored.fingerprint, record.fingerprint);
        assert_ne!(stored.fingerprint, before.fingerprint);
        assert_eq!(stored.revision, before.revision + 1);
        assert_eq!(applied.document.revision, stored.revision);
    }

    #[tokio::test]
    async fn delete_marks_inactive_and_keeps_content() {
        let store = Arc::new(MemoryDocumentStore::new());
        let sync = sync(&store);
        let created = DeltaEntry::Created(membership(4));
        sync.apply(&created).await.unwrap();
        let before = store.document(&created.id()).unwrap();

        let deleted = DeltaEntry::Deleted {
            id: created.id(),
            previous: before.fingerprint.clone(),
        };
        sync.apply(&deleted).await.unwrap();
        sync.apply(&deleted).await.unwrap();

        let stored = store.document(&created.id()).unwrap();
        assert!(!stored.active);
        assert!(stored.refs.is_empty());
        assert_eq!(stored.content, before.content);
        assert_eq!(stored.revision, before.revision + 1);
    }

    #[tokio::test]
    async fn deleting_an_unknown_key_is_a_no_op() {
        let store = Arc::new(MemoryDocumentStore::new());
        let entry = DeltaEntry::Deleted {
            id: DocumentId::new(Collection::Members, "ghost"),
            previous: membership(1).fingerprint,
        };
        assert!(sync(&store).apply(&entry).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_races_are_retried_then_reported() {
        let store = Arc::new(MemoryDocumentStore::new());
        let entry = DeltaEntry::Created(membership(4));

        store.contend(&entry.id(), 2);
        assert!(sync(&store).apply(&entry).await.unwrap().unwrap().written);

        let other = DeltaEntry::Created(membership(3));
        store.contend(&other.id(), 10);
        let err = sync(&store).apply(&other).await.unwrap_err();
        assert!(matches!(err, SyncError::WriteContention { attempts: 6, .. }));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_unavailable() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.faults().set_down(true);
        let err = sync(&store)
            .apply(&DeltaEntry::Created(membership(4)))
            .await
            .unwrap_err();
        assert!(err.is_systemic());
        assert!(matches!(
            err,
            SyncError::ExternalSystemUnavailable {
                last_error: StoreError::Unavailable(_),
                ..
            }
        ));
    }
}
