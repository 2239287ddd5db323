//! Run summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::model::DeltaKind;
use crate::error::SyncError;
use crate::record::model::Collection;

/// Stage of a run in which an issue arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Constraints,
    Fetch,
    Normalize,
    Stage,
    Detect,
    Recovery,
    Document,
    Asset,
    Graph,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constraints => "constraints",
            Self::Fetch => "fetch",
            Self::Normalize => "normalize",
            Self::Stage => "stage",
            Self::Detect => "detect",
            Self::Recovery => "recovery",
            Self::Document => "document",
            Self::Asset => "asset",
            Self::Graph => "graph",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SchemaViolation,
    DuplicateKeyConflict,
    SuspiciousEmptyBatch,
    IncompleteFeed,
    ExternalSystemUnavailable,
    ExternalSystemRejected,
    ReferentialIntegrityViolation,
    WriteContention,
    Cancelled,
    Config,
}

/// One structured report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub collection: Option<Collection>,
    pub key: Option<String>,
    pub phase: Phase,
    pub kind: IssueKind,
    pub cause: String,
}

impl Issue {
    /// Build from an error, filling collection and key from the error when
    /// the caller does not know them.
    pub fn from_error(
        err: &SyncError,
        phase: Phase,
        collection: Option<Collection>,
        key: Option<&str>,
    ) -> Self {
        Self {
            collection: collection.or_else(|| err.collection()),
            key: key.or_else(|| err.key()).map(str::to_string),
            phase,
            kind: err.kind(),
            cause: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub received: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Rows or keys left untouched because of a per-record issue.
    pub skipped: usize,
    pub graph_synced: usize,
    pub assets_synced: usize,
}

impl CollectionStats {
    pub fn applied(&mut self, kind: DeltaKind) {
        match kind {
            DeltaKind::Created => self.created += 1,
            DeltaKind::Updated => self.updated += 1,
            DeltaKind::Unchanged => self.unchanged += 1,
            DeltaKind::Deleted => self.deleted += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Finished, but some records or phases were skipped.
    CompletedWithSkips,
    /// Stopped by a systemic failure.
    Aborted { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub collections: BTreeMap<Collection, CollectionStats>,
    pub issues: Vec<Issue>,
    /// Pending documents re-materialized before the apply phase.
    pub recovered: usize,
    /// False when the graph phase was switched off during the run.
    pub graph_enabled: bool,
    pub outcome: RunOutcome,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            collections: BTreeMap::new(),
            issues: Vec::new(),
            recovered: 0,
            graph_enabled: true,
            outcome: RunOutcome::Completed,
        }
    }

    pub fn stats(&mut self, collection: Collection) -> &mut CollectionStats {
        self.collections.entry(collection).or_default()
    }

    pub fn record(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn record_error(
        &mut self,
        err: &SyncError,
        phase: Phase,
        collection: Option<Collection>,
        key: Option<&str>,
    ) {
        self.record(Issue::from_error(err, phase, collection, key));
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.outcome = RunOutcome::Aborted {
            reason: reason.into(),
        };
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Aborted { .. })
    }

    /// Close the report, deriving the outcome unless it was already decided.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        if self.outcome == RunOutcome::Completed && (!self.issues.is_empty() || !self.graph_enabled)
        {
            self.outcome = RunOutcome::CompletedWithSkips;
        }
    }

    /// 0 clean, 2 records skipped, 1 aborted, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::CompletedWithSkips => 2,
            RunOutcome::Aborted { .. } => 1,
            RunOutcome::Cancelled => 130,
        }
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }

    pub fn totals(&self) -> CollectionStats {
        self.collections
            .values()
            .fold(CollectionStats::default(), |mut acc, s| {
                acc.received += s.received;
                acc.created += s.created;
                acc.updated += s.updated;
                acc.unchanged += s.unchanged;
                acc.deleted += s.deleted;
                acc.skipped += s.skipped;
                acc.graph_synced += s.graph_synced;
                acc.assets_synced += s.assets_synced;
                acc
            })
    }
}
