//! Run orchestration.
//!
//! One run is: constraints, plan (fetch, stage, detect for every
//! collection), recovery of pending documents, then apply. Nothing is
//! written before every collection has been planned, so a suspicious batch
//! or an unreachable document store stops the run before any destructive
//! effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use shelf_core::{
    detect, stage, BlobStore, Collection, DeltaEntry, DeltaKind, DeltaSet, DocumentId,
    DocumentStore, DuplicatePolicy, ExternalSystem, GraphStore, Issue, Phase, RetryPolicy,
    RunOutcome, RunReport, SourceFeed, StagingOutcome, StoreError, SyncConfig, SyncError,
};
use tracing::{debug, error, info, warn};

use crate::assets::AssetSync;
use crate::document::DocumentSync;
use crate::materialize::{GraphMaterializer, Materialized};

/// Flags shared by the workers of one run.
#[derive(Debug)]
struct RunState {
    graph_enabled: AtomicBool,
    halt: Mutex<Option<String>>,
}

impl RunState {
    fn new() -> Self {
        Self {
            graph_enabled: AtomicBool::new(true),
            halt: Mutex::new(None),
        }
    }

    fn graph_enabled(&self) -> bool {
        self.graph_enabled.load(Ordering::SeqCst)
    }

    fn disable_graph(&self, reason: &SyncError) {
        if self.graph_enabled.swap(false, Ordering::SeqCst) {
            warn!(error = %reason, "Graph store unusable, graph phase disabled for this run");
        }
    }

    fn halt(&self, reason: &SyncError) {
        let mut halt = self.halt.lock().unwrap_or_else(PoisonError::into_inner);
        if halt.is_none() {
            error!(error = %reason, "Halting run");
            *halt = Some(reason.to_string());
        }
    }

    fn halted(&self) -> bool {
        self.halt_reason().is_some()
    }

    fn halt_reason(&self) -> Option<String> {
        self.halt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// What happened to one key during the apply phase.
#[derive(Debug)]
struct KeyOutcome {
    collection: Collection,
    kind: DeltaKind,
    applied: bool,
    skipped: bool,
    graph_synced: bool,
    asset_synced: bool,
    issues: Vec<Issue>,
}

impl KeyOutcome {
    fn new(collection: Collection, kind: DeltaKind) -> Self {
        Self {
            collection,
            kind,
            applied: false,
            skipped: false,
            graph_synced: false,
            asset_synced: false,
            issues: Vec::new(),
        }
    }
}

/// Drives one sync run against the configured stores.
pub struct SyncEngine {
    documents: Arc<dyn DocumentStore>,
    document_sync: DocumentSync,
    materializer: GraphMaterializer,
    assets: Option<AssetSync>,
    settings: SyncConfig,
    policy: RetryPolicy,
}

impl SyncEngine {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        graph: Arc<dyn GraphStore>,
        settings: SyncConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            document_sync: DocumentSync::new(
                documents.clone(),
                policy.clone(),
                settings.conflict_retries,
            ),
            materializer: GraphMaterializer::new(documents.clone(), graph, policy.clone()),
            documents,
            assets: None,
            settings,
            policy,
        }
    }

    /// Copy document images into `blobs` as part of each upsert.
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.assets = Some(AssetSync::new(blobs, self.policy.clone()));
        self
    }

    /// Run one sync over `feeds`. `cancel` is checked between batches.
    pub async fn run(&self, feeds: &[Box<dyn SourceFeed>], cancel: &AtomicBool) -> RunReport {
        let mut report = RunReport::new();
        let state = RunState::new();
        info!(run_id = %report.run_id, feeds = feeds.len(), "Starting sync run");

        if let Err(err) = self.materializer.ensure_constraints().await {
            report.record_error(&err, Phase::Constraints, None, None);
            state.disable_graph(&err);
        }

        let Some(mut plans) = self.plan(feeds, &mut report).await else {
            return self.close(report, &state, false);
        };
        plans.sort_by_key(|plan| plan.collection);

        let mut cancelled = self.recover(&mut report, &state, cancel).await;
        if !cancelled && !state.halted() {
            cancelled = self.apply(&plans, &mut report, &state, cancel).await;
        }

        self.close(report, &state, cancelled)
    }

    /// Fetch, stage and diff every feed. `None` means the run was aborted.
    async fn plan(&self, feeds: &[Box<dyn SourceFeed>], report: &mut RunReport) -> Option<Vec<DeltaSet>> {
        let mut plans = Vec::new();

        for feed in feeds {
            let feed: &dyn SourceFeed = feed.as_ref();
            let collection = feed.collection();

            let fetched = async {
                let expected = self
                    .policy
                    .call(ExternalSystem::SourceFeed, "total_count", move || feed.total_count())
                    .await?;
                let records = self
                    .policy
                    .call(ExternalSystem::SourceFeed, "fetch", move || feed.fetch())
                    .await?;
                Ok::<_, SyncError>((expected, records))
            }
            .await;
            let (expected, records) = match fetched {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(collection = %collection, error = %err, "Source unavailable, skipping collection");
                    report.record_error(&err, Phase::Fetch, Some(collection), None);
                    continue;
                }
            };

            let received = records.len();
            report.stats(collection).received = received;
            if received < expected {
                let err = SyncError::IncompleteFeed {
                    collection,
                    expected,
                    received,
                };
                warn!(collection = %collection, expected, received, "Feed ended early, skipping collection");
                report.stats(collection).skipped += received;
                report.record_error(&err, Phase::Fetch, Some(collection), None);
                continue;
            }

            let StagingOutcome { batch, issues } =
                stage(collection, records, expected, self.settings.duplicate_policy);
            for issue in &issues {
                let (phase, skipped) = match issue {
                    SyncError::DuplicateKeyConflict { occurrences, .. } => {
                        let dropped = match self.settings.duplicate_policy {
                            DuplicatePolicy::Reject => *occurrences,
                            _ => occurrences.saturating_sub(1),
                        };
                        (Phase::Stage, dropped)
                    }
                    _ => (Phase::Normalize, 1),
                };
                report.stats(collection).skipped += skipped;
                report.record_error(issue, phase, Some(collection), None);
            }

            let documents = self.documents.clone();
            let stored = self
                .policy
                .call(ExternalSystem::DocumentStore, "fingerprints", || {
                    let documents = documents.clone();
                    async move { documents.fingerprints(collection).await }
                })
                .await;
            let delta = stored.and_then(|stored| detect(&batch, &stored, self.settings.guard_for(collection)));
            match delta {
                Ok(delta) => {
                    info!(
                        collection = %collection,
                        created = delta.count(DeltaKind::Created),
                        updated = delta.count(DeltaKind::Updated),
                        unchanged = delta.unchanged,
                        deleted = delta.count(DeltaKind::Deleted),
                        held = batch.held.len(),
                        "Delta detected"
                    );
                    report.stats(collection).unchanged = delta.unchanged;
                    plans.push(delta);
                }
                Err(err) => {
                    error!(collection = %collection, error = %err, "Aborting run before any write");
                    report.record_error(&err, Phase::Detect, Some(collection), None);
                    report.abort(err.to_string());
                    return None;
                }
            }
        }

        Some(plans)
    }

    /// Re-materialize documents left pending by earlier runs.
    ///
    /// Returns true when cancelled.
    async fn recover(&self, report: &mut RunReport, state: &RunState, cancel: &AtomicBool) -> bool {
        if !state.graph_enabled() {
            return false;
        }

        let documents = self.documents.clone();
        let pending = match self
            .policy
            .call(ExternalSystem::DocumentStore, "pending", || {
                let documents = documents.clone();
                async move { documents.pending().await }
            })
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                report.record_error(&err, Phase::Recovery, None, None);
                state.halt(&err);
                return false;
            }
        };
        if pending.is_empty() {
            return false;
        }
        info!(pending = pending.len(), "Recovering pending documents");

        for chunk in pending.chunks(self.settings.batch_size.max(1)) {
            if cancel.load(Ordering::SeqCst) {
                return true;
            }
            if state.halted() || !state.graph_enabled() {
                break;
            }

            let results: Vec<_> = stream::iter(chunk)
                .map(|id| self.recover_one(id, state))
                .buffer_unordered(self.settings.workers.max(1))
                .collect()
                .await;
            for (collection, result) in results {
                match result {
                    Ok(true) => {
                        report.recovered += 1;
                        report.stats(collection).graph_synced += 1;
                    }
                    Ok(false) => {}
                    Err(issue) => report.record(issue),
                }
            }
        }
        false
    }

    async fn recover_one(&self, id: &DocumentId, state: &RunState) -> (Collection, Result<bool, Issue>) {
        let collection = id.collection;
        if state.halted() || !state.graph_enabled() {
            return (collection, Ok(false));
        }
        let doc = match self.document_sync.get(id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return (collection, Ok(false)),
            Err(err) => {
                if err.is_systemic() {
                    state.halt(&err);
                }
                return (
                    collection,
                    Err(Issue::from_error(&err, Phase::Recovery, Some(collection), Some(&id.key))),
                );
            }
        };
        match self.materializer.materialize(&doc).await {
            Ok(Materialized::Synced { .. }) => (collection, Ok(true)),
            Ok(_) => (collection, Ok(false)),
            Err(err) => (collection, Err(self.graph_issue(err, state, Phase::Recovery, id))),
        }
    }

    /// Upserts of every collection first, then deletions, in cancellable
    /// batches. Returns true when cancelled.
    async fn apply(&self, plans: &[DeltaSet], report: &mut RunReport, state: &RunState, cancel: &AtomicBool) -> bool {
        let (deletes, upserts): (Vec<&DeltaEntry>, Vec<&DeltaEntry>) = plans
            .iter()
            .flat_map(|plan| plan.entries.iter())
            .partition(|entry| entry.kind() == DeltaKind::Deleted);
        let entries: Vec<&DeltaEntry> = upserts.into_iter().chain(deletes).collect();
        if entries.is_empty() {
            info!("Nothing to apply");
            return false;
        }
        info!(entries = entries.len(), workers = self.settings.workers, "Applying deltas");

        for (index, chunk) in entries.chunks(self.settings.batch_size.max(1)).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                warn!(batch = index, "Run cancelled between batches");
                return true;
            }
            if state.halted() {
                break;
            }
            debug!(batch = index, size = chunk.len(), "Applying batch");

            let outcomes: Vec<KeyOutcome> = stream::iter(chunk.iter().copied())
                .map(|entry| self.apply_one(entry, state))
                .buffer_unordered(self.settings.workers.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                let stats = report.stats(outcome.collection);
                if outcome.applied {
                    stats.applied(outcome.kind);
                }
                if outcome.skipped {
                    stats.skipped += 1;
                }
                if outcome.graph_synced {
                    stats.graph_synced += 1;
                }
                if outcome.asset_synced {
                    stats.assets_synced += 1;
                }
                for issue in outcome.issues {
                    report.record(issue);
                }
            }
        }
        false
    }

    /// Document write, then asset copy, then graph, for one key.
    async fn apply_one(&self, entry: &DeltaEntry, state: &RunState) -> KeyOutcome {
        let id = entry.id();
        let mut outcome = KeyOutcome::new(id.collection, entry.kind());
        if state.halted() {
            return outcome;
        }

        let applied = match self.document_sync.apply(entry).await {
            Ok(applied) => applied,
            Err(err) => {
                if err.is_systemic() {
                    state.halt(&err);
                } else {
                    warn!(id = %id, error = %err, "Document not synced");
                }
                outcome.skipped = true;
                outcome
                    .issues
                    .push(Issue::from_error(&err, Phase::Document, Some(id.collection), Some(&id.key)));
                return outcome;
            }
        };
        outcome.applied = true;
        let Some(applied) = applied else {
            return outcome;
        };

        if let (Some(assets), Some(_)) = (&self.assets, entry.staged()) {
            match assets.sync(&applied.document).await {
                Ok(reference) => outcome.asset_synced = reference.is_some(),
                Err(err) => {
                    warn!(id = %id, error = %err, "Asset sync failed");
                    outcome
                        .issues
                        .push(Issue::from_error(&err, Phase::Asset, Some(id.collection), Some(&id.key)));
                }
            }
        }

        if state.graph_enabled() && !state.halted() {
            match self.materializer.materialize(&applied.document).await {
                Ok(Materialized::Synced { .. }) => outcome.graph_synced = true,
                Ok(_) => {}
                Err(err) => outcome.issues.push(self.graph_issue(err, state, Phase::Graph, &id)),
            }
        }
        outcome
    }

    /// Turn a materialization failure into an issue, switching off the
    /// graph phase or halting the run when the failure is not per-record.
    fn graph_issue(&self, err: SyncError, state: &RunState, phase: Phase, id: &DocumentId) -> Issue {
        if err.is_systemic() {
            state.halt(&err);
        } else if graph_is_unusable(&err) {
            state.disable_graph(&err);
        } else {
            warn!(id = %id, error = %err, "Graph not synced for document");
        }
        Issue::from_error(&err, phase, Some(id.collection), Some(&id.key))
    }

    fn close(&self, mut report: RunReport, state: &RunState, cancelled: bool) -> RunReport {
        report.graph_enabled = state.graph_enabled();
        if let Some(reason) = state.halt_reason() {
            report.abort(reason);
        } else if cancelled && !report.is_aborted() {
            report.outcome = RunOutcome::Cancelled;
        }
        report.finish();

        let totals = report.totals();
        info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            created = totals.created,
            updated = totals.updated,
            unchanged = totals.unchanged,
            deleted = totals.deleted,
            skipped = totals.skipped,
            graph_synced = totals.graph_synced,
            recovered = report.recovered,
            issues = report.issues.len(),
            "Sync run finished"
        );
        report
    }
}

/// Graph failures that will repeat for every remaining document.
fn graph_is_unusable(err: &SyncError) -> bool {
    match err {
        SyncError::ExternalSystemUnavailable {
            system: ExternalSystem::GraphStore,
            ..
        } => true,
        SyncError::ExternalSystemRejected {
            system: ExternalSystem::GraphStore,
            error,
            ..
        } => matches!(error, StoreError::Auth(_)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_wide_graph_failures_disable_the_phase() {
        let down = SyncError::ExternalSystemUnavailable {
            system: ExternalSystem::GraphStore,
            operation: "merge_node".into(),
            attempts: 3,
            last_error: StoreError::Connection("refused".into()),
        };
        assert!(graph_is_unusable(&down));

        let auth = SyncError::ExternalSystemRejected {
            system: ExternalSystem::GraphStore,
            operation: "merge_node".into(),
            error: StoreError::Auth("expired".into()),
        };
        assert!(graph_is_unusable(&auth));

        let dangling = SyncError::ReferentialIntegrityViolation {
            relationship: "Member:m1-[USER_READ]->Book:b1".into(),
            detail: "endpoint Book:b1 does not exist".into(),
        };
        assert!(!graph_is_unusable(&dangling));
    }

    #[test]
    fn halting_keeps_the_first_reason() {
        let state = RunState::new();
        assert!(!state.halted());
        state.halt(&SyncError::Cancelled);
        state.halt(&SyncError::WriteContention {
            id: "members:m1".into(),
            attempts: 3,
        });
        assert_eq!(state.halt_reason().as_deref(), Some("run cancelled"));
    }
}
