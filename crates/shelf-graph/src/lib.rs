//! Shelf Graph
//!
//! Neo4j implementation of the graph store: connection client, Cypher
//! statements and the [`GraphStore`](shelf_core::GraphStore) adapter.

pub mod client;
pub mod schema;
pub mod store;

pub use client::GraphClient;
pub use store::Neo4jGraphStore;
