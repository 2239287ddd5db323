//! # Shelf Redis
//!
//! Production document store for Shelf, kept in Redis hashes and sets.

pub mod client;
pub mod documents;

pub use client::{init_pool, RedisError, RedisPool, RedisResult};
pub use documents::RedisDocumentStore;
