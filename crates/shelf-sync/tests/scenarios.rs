//! End-to-end runs against the in-memory stores.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};
use shelf_core::store::memory::{MemoryBlobStore, MemoryDocumentStore, MemoryGraphStore, StaticFeed};
use shelf_core::{
    Collection, DocumentId, DuplicatePolicy, IssueKind, NodeKey, NodeLabel, Phase, RelType,
    RelationshipKey, RetryPolicy, RunOutcome, RunReport, SourceFeed, StoreError, SyncConfig,
};
use shelf_sync::SyncEngine;

struct World {
    documents: Arc<MemoryDocumentStore>,
    graph: Arc<MemoryGraphStore>,
    blobs: Arc<MemoryBlobStore>,
    settings: SyncConfig,
}

impl World {
    fn new() -> Self {
        Self {
            documents: Arc::new(MemoryDocumentStore::new()),
            graph: Arc::new(MemoryGraphStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            settings: SyncConfig {
                workers: 4,
                batch_size: 2,
                ..SyncConfig::default()
            },
        }
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.documents.clone(),
            self.graph.clone(),
            self.settings.clone(),
            RetryPolicy::immediate(3),
        )
        .with_blobs(self.blobs.clone())
    }

    async fn run(&self, feeds: Vec<StaticFeed>) -> RunReport {
        let feeds: Vec<Box<dyn SourceFeed>> = feeds
            .into_iter()
            .map(|feed| Box::new(feed) as Box<dyn SourceFeed>)
            .collect();
        self.engine().run(&feeds, &AtomicBool::new(false)).await
    }

    fn doc(&self, collection: Collection, key: &str) -> shelf_core::PersistedDocument {
        self.documents
            .document(&DocumentId::new(collection, key))
            .expect("document stored")
    }
}

fn feed(collection: Collection, values: Vec<Value>) -> StaticFeed {
    StaticFeed::from_values(collection, values)
}

fn membership(rating: i64) -> Value {
    json!({"membership_id": "ms1", "member_id": "m1", "club_id": "c1", "rating": rating})
}

fn member_of_club() -> RelationshipKey {
    RelationshipKey {
        from: NodeKey::new(NodeLabel::Member, "m1"),
        rel_type: RelType::MemberOfClub,
        to: NodeKey::new(NodeLabel::Club, "c1"),
    }
}

#[tokio::test]
async fn first_run_creates_document_nodes_and_relationship() {
    let world = World::new();
    let report = world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), 0);
    let stats = &report.collections[&Collection::Memberships];
    assert_eq!(stats.created, 1);
    assert_eq!(stats.graph_synced, 1);

    let doc = world.doc(Collection::Memberships, "ms1");
    assert!(doc.active);
    assert!(!doc.is_pending());

    let mut nodes = world.graph.node_keys();
    nodes.sort();
    assert_eq!(
        nodes,
        vec![
            NodeKey::new(NodeLabel::Member, "m1"),
            NodeKey::new(NodeLabel::Club, "c1"),
        ]
    );
    assert_eq!(world.graph.relationship_keys(), vec![member_of_club()]);
}

#[tokio::test]
async fn rerun_with_same_input_writes_nothing() {
    let world = World::new();
    world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;
    let revision = world.doc(Collection::Memberships, "ms1").revision;
    let graph_writes = world.graph.writes();

    let report = world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;

    let stats = &report.collections[&Collection::Memberships];
    assert_eq!(stats.unchanged, 1);
    assert_eq!((stats.created, stats.updated, stats.deleted), (0, 0, 0));
    assert_eq!(report.recovered, 0);
    assert_eq!(world.graph.writes(), graph_writes);
    assert_eq!(world.doc(Collection::Memberships, "ms1").revision, revision);
}

#[tokio::test]
async fn changed_rating_updates_relationship_in_place() {
    let world = World::new();
    world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;
    let before = world.doc(Collection::Memberships, "ms1");

    let report = world
        .run(vec![feed(Collection::Memberships, vec![membership(5)])])
        .await;

    assert_eq!(report.collections[&Collection::Memberships].updated, 1);
    let after = world.doc(Collection::Memberships, "ms1");
    assert_ne!(after.fingerprint, before.fingerprint);

    let props = world.graph.relationship(&member_of_club()).unwrap();
    assert_eq!(props.get("rating").and_then(|v| v.as_integer()), Some(5));
    assert_eq!(world.graph.relationship_keys(), vec![member_of_club()]);
    assert_eq!(world.graph.node_keys().len(), 2);
}

#[tokio::test]
async fn cleared_field_is_removed_from_node() {
    let world = World::new();
    world
        .run(vec![feed(
            Collection::Members,
            vec![json!({"member_id": "m1", "handle": "ada", "country": "PT"})],
        )])
        .await;

    let report = world
        .run(vec![feed(
            Collection::Members,
            vec![json!({"member_id": "m1", "handle": "ada"})],
        )])
        .await;

    assert_eq!(report.collections[&Collection::Members].updated, 1);
    let props = world.graph.node(&NodeKey::new(NodeLabel::Member, "m1")).unwrap();
    assert!(!props.contains_key("country"));
    assert_eq!(props.get("handle").and_then(|v| v.as_text()), Some("ada"));
}

#[tokio::test]
async fn shared_edge_follows_its_remaining_read() {
    let world = World::new();
    let read = |id: &str, rating: i64| {
        json!({"read_id": id, "member_id": "m1", "book_id": "b1", "rating": rating})
    };
    world
        .run(vec![feed(Collection::Reads, vec![read("r1", 2), read("r2", 5)])])
        .await;

    let report = world
        .run(vec![feed(Collection::Reads, vec![read("r1", 2)])])
        .await;

    assert_eq!(report.collections[&Collection::Reads].deleted, 1);
    let edge = RelationshipKey {
        from: NodeKey::new(NodeLabel::Member, "m1"),
        rel_type: RelType::UserRead,
        to: NodeKey::new(NodeLabel::Book, "b1"),
    };
    let props = world.graph.relationship(&edge).expect("edge still supported by r1");
    assert_eq!(props.get("rating").and_then(|v| v.as_integer()), Some(2));
}

#[tokio::test]
async fn removed_record_is_soft_deleted_and_graph_cleaned() {
    let mut world = World::new();
    world
        .run(vec![
            feed(Collection::Members, vec![json!({"member_id": "m1", "handle": "ada"})]),
            feed(Collection::Memberships, vec![membership(4)]),
        ])
        .await;

    world
        .settings
        .min_batch_overrides
        .insert("memberships".to_string(), 0);
    let report = world
        .run(vec![
            feed(Collection::Members, vec![json!({"member_id": "m1", "handle": "ada"})]),
            feed(Collection::Memberships, vec![]),
        ])
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.collections[&Collection::Memberships].deleted, 1);

    let doc = world.doc(Collection::Memberships, "ms1");
    assert!(!doc.active);
    assert!(doc.deleted_at.is_some());
    assert_eq!(doc.content.get("rating").and_then(|v| v.as_integer()), Some(4));

    assert!(world.graph.relationship(&member_of_club()).is_none());
    // Still supported by the member document.
    assert!(world.graph.node(&NodeKey::new(NodeLabel::Member, "m1")).is_some());
    assert!(world.graph.node(&NodeKey::new(NodeLabel::Club, "c1")).is_none());
}

#[tokio::test]
async fn empty_batch_below_floor_aborts_before_any_write() {
    let world = World::new();
    world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;
    let graph_writes = world.graph.writes();

    let report = world.run(vec![feed(Collection::Memberships, vec![])]).await;

    assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.count(IssueKind::SuspiciousEmptyBatch), 1);
    assert!(world.doc(Collection::Memberships, "ms1").active);
    assert_eq!(world.graph.writes(), graph_writes);
}

#[tokio::test]
async fn bad_rows_are_skipped_and_their_keys_held() {
    let world = World::new();
    world
        .run(vec![feed(
            Collection::Members,
            vec![
                json!({"member_id": "m1", "handle": "ada"}),
                json!({"member_id": "m2", "handle": "bob"}),
            ],
        )])
        .await;

    let report = world
        .run(vec![feed(
            Collection::Members,
            vec![
                json!({"member_id": "m1", "handle": "ada", "country": "PT"}),
                // Required handle missing: reported, and m2 is not deleted.
                json!({"member_id": "m2"}),
                json!({"handle": "nobody"}),
            ],
        )])
        .await;

    assert_eq!(report.outcome, RunOutcome::CompletedWithSkips);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.count(IssueKind::SchemaViolation), 2);
    let stats = &report.collections[&Collection::Members];
    assert_eq!((stats.received, stats.updated, stats.deleted, stats.skipped), (3, 1, 0, 2));
    assert!(world.doc(Collection::Members, "m2").active);

    let held = report
        .issues
        .iter()
        .find(|issue| issue.key.as_deref() == Some("m2"))
        .unwrap();
    assert_eq!(held.phase, Phase::Normalize);
}

#[tokio::test]
async fn duplicate_keys_follow_the_configured_policy() {
    let rows = vec![
        json!({"member_id": "m1", "handle": "first"}),
        json!({"member_id": "m1", "handle": "last"}),
    ];

    let world = World::new();
    let report = world.run(vec![feed(Collection::Members, rows.clone())]).await;
    assert_eq!(report.count(IssueKind::DuplicateKeyConflict), 1);
    assert_eq!(
        world.doc(Collection::Members, "m1").content["handle"].as_text(),
        Some("last")
    );

    let mut world = World::new();
    world.settings.duplicate_policy = DuplicatePolicy::Reject;
    let report = world.run(vec![feed(Collection::Members, rows)]).await;
    assert_eq!(report.count(IssueKind::DuplicateKeyConflict), 1);
    assert!(world
        .documents
        .document(&DocumentId::new(Collection::Members, "m1"))
        .is_none());
}

#[tokio::test]
async fn graph_outage_leaves_documents_pending_until_next_run() {
    let world = World::new();
    world.graph.faults().set_down(true);
    let report = world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;

    assert_eq!(report.outcome, RunOutcome::CompletedWithSkips);
    assert!(!report.graph_enabled);
    assert_eq!(report.collections[&Collection::Memberships].created, 1);
    assert!(world.doc(Collection::Memberships, "ms1").is_pending());

    world.graph.faults().set_down(false);
    let report = world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.collections[&Collection::Memberships].unchanged, 1);
    assert!(!world.doc(Collection::Memberships, "ms1").is_pending());
    assert_eq!(world.graph.relationship_keys(), vec![member_of_club()]);
}

#[tokio::test]
async fn document_store_outage_aborts_the_run() {
    let world = World::new();
    world.documents.faults().set_down(true);
    let report = world
        .run(vec![feed(Collection::Memberships, vec![membership(4)])])
        .await;

    assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.count(IssueKind::ExternalSystemUnavailable), 1);
    assert!(world.graph.relationship_keys().is_empty());
}

#[tokio::test]
async fn unreachable_source_skips_only_that_collection() {
    let world = World::new();
    world
        .run(vec![feed(Collection::Members, vec![json!({"member_id": "m1", "handle": "ada"})])])
        .await;

    let broken = feed(Collection::Members, vec![]);
    broken.faults().set_down(true);
    let report = world
        .run(vec![broken, feed(Collection::Memberships, vec![membership(4)])])
        .await;

    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.collections[&Collection::Memberships].created, 1);
    assert!(world.doc(Collection::Members, "m1").active);
    let issue = report
        .issues
        .iter()
        .find(|issue| issue.phase == Phase::Fetch)
        .unwrap();
    assert_eq!(issue.collection, Some(Collection::Members));
}

#[tokio::test]
async fn short_feed_is_not_trusted_for_deletions() {
    let world = World::new();
    world
        .run(vec![feed(
            Collection::Members,
            vec![
                json!({"member_id": "m1", "handle": "ada"}),
                json!({"member_id": "m2", "handle": "bob"}),
            ],
        )])
        .await;

    let short = feed(
        Collection::Members,
        vec![json!({"member_id": "m1", "handle": "ada"})],
    )
    .with_reported_count(2);
    let report = world.run(vec![short]).await;

    assert_eq!(report.count(IssueKind::IncompleteFeed), 1);
    assert!(world.doc(Collection::Members, "m2").active);
}

#[tokio::test]
async fn images_are_copied_and_failures_do_not_block_sync() {
    let world = World::new();
    world
        .blobs
        .faults()
        .fail_next("put_from_url", StoreError::Auth("expired".into()));
    let report = world
        .run(vec![feed(
            Collection::Books,
            vec![json!({
                "book_id": "b1",
                "title": "Dune",
                "authors": "Frank Herbert",
                "genres": ["SciFi"],
                "cover_url": "https://img.example.com/dune.jpg",
            })],
        )])
        .await;

    assert_eq!(report.count(IssueKind::ExternalSystemRejected), 1);
    assert_eq!(report.collections[&Collection::Books].created, 1);
    assert_eq!(report.collections[&Collection::Books].graph_synced, 1);
    assert!(world.blobs.objects().is_empty());
    assert!(world
        .graph
        .node(&NodeKey::new(NodeLabel::Creator, "Frank Herbert"))
        .is_some());

    let world = World::new();
    let report = world
        .run(vec![feed(
            Collection::Members,
            vec![json!({"member_id": "m9", "handle": "eve", "avatar_url": "https://img.example.com/eve.png"})],
        )])
        .await;
    assert_eq!(report.collections[&Collection::Members].assets_synced, 1);
    assert!(world.blobs.objects().contains_key("members/m9.png"));
}

#[tokio::test]
async fn cancellation_stops_before_the_next_batch() {
    let world = World::new();
    let feeds: Vec<Box<dyn SourceFeed>> = vec![Box::new(feed(
        Collection::Memberships,
        vec![membership(4)],
    ))];
    let report = world.engine().run(&feeds, &AtomicBool::new(true)).await;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.exit_code(), 130);
    assert!(world
        .documents
        .document(&DocumentId::new(Collection::Memberships, "ms1"))
        .is_none());
}

#[tokio::test]
async fn many_keys_sharing_nodes_converge() {
    let world = World::new();
    let reads: Vec<Value> = (0..12)
        .map(|i| {
            json!({
                "read_id": format!("r{}", i),
                "member_id": format!("m{}", i % 3),
                "book_id": format!("b{}", i % 4),
                "rating": i % 6,
            })
        })
        .collect();
    let report = world.run(vec![feed(Collection::Reads, reads)]).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.collections[&Collection::Reads].created, 12);
    let counts = shelf_core::GraphStore::counts(world.graph.as_ref()).await.unwrap();
    assert_eq!(counts.nodes.get("Member"), Some(&3));
    assert_eq!(counts.nodes.get("Book"), Some(&4));
    assert_eq!(counts.relationships.get("USER_READ"), Some(&12));
}
