//! # Shelf Sync
//!
//! Applies detected deltas to the document store and keeps the property
//! graph in step with it.
//!
//! For any one key the document write is durable before the graph is
//! touched; independent keys run concurrently on a bounded pool.

pub mod assets;
pub mod document;
pub mod engine;
pub mod locks;
pub mod materialize;

pub use assets::AssetSync;
pub use document::{Applied, DocumentSync};
pub use engine::SyncEngine;
pub use locks::KeyedLocks;
pub use materialize::{GraphMaterializer, Materialized};
