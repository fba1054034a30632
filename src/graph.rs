//! The abstract quad-store contract shared by the in-memory and the
//! persistent store, together with the types that cross it.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::{Direction, Quad, Value};

/// The four direction ids of a stored quad. An id of 0 means "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QuadIds {
    pub subject: u64,
    pub predicate: u64,
    pub object: u64,
    pub label: u64,
}

impl QuadIds {
    pub fn get(&self, d: Direction) -> u64 {
        match d {
            Direction::Subject => self.subject,
            Direction::Predicate => self.predicate,
            Direction::Object => self.object,
            Direction::Label => self.label,
        }
    }

    pub fn set(&mut self, d: Direction, id: u64) {
        match d {
            Direction::Subject => self.subject = id,
            Direction::Predicate => self.predicate = id,
            Direction::Object => self.object = id,
            Direction::Label => self.label = id,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == QuadIds::default()
    }
}

/// A store-specific reference to a value or a quad.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ref {
    /// A node, addressed by its primitive id.
    Node(u64),
    /// A quad, addressed by its primitive id with the direction ids
    /// prefetched.
    Quad { id: u64, dirs: QuadIds },
}

impl Ref {
    pub fn id(&self) -> u64 {
        match self {
            Ref::Node(id) => *id,
            Ref::Quad { id, .. } => *id,
        }
    }
}

/// A single unit of transactional mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Delta {
    pub action: Action,
    pub quad: Quad,
}

impl Delta {
    pub fn add(quad: Quad) -> Delta {
        Delta {
            action: Action::Add,
            quad,
        }
    }

    pub fn delete(quad: Quad) -> Delta {
        Delta {
            action: Action::Delete,
            quad,
        }
    }
}

/// Controls how semantic conflicts are treated during delta application.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreOpts {
    /// Skip adds of quads that already exist instead of failing.
    pub ignore_dup: bool,
    /// Skip deletes of quads that do not exist instead of failing.
    pub ignore_missing: bool,
}

/// A size which may be exact or a best-effort estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub value: i64,
    pub exact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub nodes: Size,
    pub quads: Size,
}

/// String-keyed construction options, loosely typed the way front-ends
/// hand them down.
#[derive(Debug, Clone, Default)]
pub struct Options(BTreeMap<String, serde_json::Value>);

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Options {
        self.set(key, value);
        self
    }

    pub fn bool_key(&self, key: &str, default: bool) -> bool {
        self.0
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }
}

/// An owning iterator over quad references, snapshot at creation time.
#[derive(Debug)]
pub struct QuadRefIter {
    refs: std::vec::IntoIter<Ref>,
}

impl QuadRefIter {
    pub fn new(refs: Vec<Ref>) -> QuadRefIter {
        QuadRefIter {
            refs: refs.into_iter(),
        }
    }

    pub fn empty() -> QuadRefIter {
        QuadRefIter::new(Vec::new())
    }
}

impl Iterator for QuadRefIter {
    type Item = Ref;

    fn next(&mut self) -> Option<Ref> {
        self.refs.next()
    }
}

/// A streaming quad writer. Buffered implementations flush and begin a new
/// transaction once enough quads accumulate; `close` flushes the remainder.
pub trait QuadWriter {
    fn write_quad(&mut self, q: Quad) -> Result<()> {
        self.write_quads(std::slice::from_ref(&q)).map(|_| ())
    }

    fn write_quads(&mut self, quads: &[Quad]) -> Result<usize>;

    fn close(&mut self) -> Result<()>;
}

/// The quad-store contract. Query layers treat implementations uniformly.
pub trait QuadStore {
    /// Resolves a value to a store reference, if the value is known.
    fn value_of(&self, v: &Value) -> Result<Option<Ref>>;

    /// Batch form of [`QuadStore::value_of`].
    fn refs_of(&self, vals: &[Value]) -> Result<Vec<Option<Ref>>> {
        vals.iter().map(|v| self.value_of(v)).collect()
    }

    /// Reverse resolution: the value behind a reference.
    fn name_of(&self, r: &Ref) -> Result<Option<Value>>;

    /// Batch form of [`QuadStore::name_of`].
    fn values_of(&self, refs: &[Ref]) -> Result<Vec<Option<Value>>> {
        refs.iter().map(|r| self.name_of(r)).collect()
    }

    /// The quad behind a quad reference.
    fn quad(&self, r: &Ref) -> Result<Quad>;

    /// The reference held by a quad in the given direction.
    fn quad_direction(&self, r: &Ref, d: Direction) -> Result<Option<Ref>>;

    /// All quads holding `r` in direction `d`, as a snapshot.
    fn quad_iterator(&self, d: Direction, r: &Ref) -> Result<QuadRefIter>;

    /// Size of the result of [`QuadStore::quad_iterator`], possibly estimated.
    fn quad_iterator_size(&self, d: Direction, r: &Ref) -> Result<Size>;

    /// Atomically applies a batch of deltas.
    fn apply_deltas(&mut self, deltas: &[Delta], opts: IgnoreOpts) -> Result<()>;

    /// Node and quad counts.
    fn stats(&self, exact: bool) -> Result<Stats>;

    /// A streaming writer over this store. The writer owns the store's
    /// write path until it is closed.
    fn new_quad_writer(&mut self) -> Result<Box<dyn QuadWriter + '_>>;

    fn close(&mut self) -> Result<()>;
}
