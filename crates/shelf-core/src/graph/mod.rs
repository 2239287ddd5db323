//! Graph model and the document-to-graph mapping.

pub mod mapping;
pub mod model;

pub use mapping::derive_graph;
