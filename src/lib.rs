//! Storage core of a directed-labeled-property graph database serving
//! RDF-style quads.
//!
//! Two stores share one contract ([`graph::QuadStore`]): a persistent
//! store layered on an opaque ordered key-value engine
//! ([`kvstore::KvQuadStore`]) and an in-memory store built on a pooled
//! B+ tree per (direction, node) pair ([`memstore::MemStore`]).

pub mod error;
pub mod graph;
pub mod kv;
pub mod kvstore;
pub mod lru;
pub mod memstore;
pub mod model;
pub mod transaction;

pub use crate::error::{Result, StoreError};
pub use crate::graph::{
    Action, Delta, IgnoreOpts, Options, QuadIds, QuadRefIter, QuadStore, QuadWriter, Ref, Size,
    Stats,
};
pub use crate::model::{Direction, Quad, Value, ValueHash};
pub use crate::transaction::Transaction;
