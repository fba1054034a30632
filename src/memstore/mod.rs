//! The in-memory quad store: value interning, an append list of
//! primitives with copy-on-write snapshots, and a per-(direction, node)
//! B+ tree index.

pub mod btree;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::graph::{
    Action, Delta, IgnoreOpts, Options, QuadIds, QuadRefIter, QuadStore, QuadWriter, Ref, Size,
    Stats,
};
use crate::model::{Direction, Quad, Value};

use btree::Tree;

/// Blank nodes of this form address primitives by id directly.
const INTERNAL_BNODE_PREFIX: &str = "memnode";

/// A primitive shared between the id map, the append list and the
/// directional index. The refcount is only mutated while the caller holds
/// the store's exclusive borrow.
#[derive(Debug)]
pub struct MemPrimitive {
    pub id: u64,
    pub quad: QuadIds,
    pub value: Option<Value>,
    refs: AtomicI64,
}

impl MemPrimitive {
    pub fn is_node(&self) -> bool {
        self.quad.is_zero()
    }

    pub fn refs(&self) -> i64 {
        self.refs.load(AtomicOrdering::Relaxed)
    }
}

type PrimRef = Arc<MemPrimitive>;

/// Four maps from node id to the tree of quads holding that node in that
/// direction.
#[derive(Debug, Default)]
pub struct QuadDirectionIndex {
    index: [HashMap<u64, Tree<PrimRef>>; 4],
}

impl QuadDirectionIndex {
    /// The tree for `(d, id)`, created on first use.
    fn tree(&mut self, d: Direction, id: u64) -> &mut Tree<PrimRef> {
        self.index[d.index()].entry(id).or_default()
    }

    fn get(&self, d: Direction, id: u64) -> Option<&Tree<PrimRef>> {
        self.index[d.index()].get(&id)
    }

    fn get_mut(&mut self, d: Direction, id: u64) -> Option<&mut Tree<PrimRef>> {
        self.index[d.index()].get_mut(&id)
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    last: u64,
    vals: HashMap<String, u64>,
    quads: HashMap<QuadIds, u64>,
    prim: HashMap<u64, PrimRef>,
    /// Append list of every live primitive. Outstanding iterators hold a
    /// second `Arc` reference, which makes the next mutation copy the
    /// list instead of disturbing their snapshot.
    all: Arc<Vec<PrimRef>>,
    index: QuadDirectionIndex,
    horizon: u64,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// A store preloaded with the given quads.
    pub fn from_quads(quads: impl IntoIterator<Item = Quad>) -> MemStore {
        let mut qs = MemStore::new();
        for q in quads {
            qs.add_quad(q);
        }
        qs
    }

    fn append_primitive(&mut self, p: PrimRef) {
        self.prim.insert(p.id, Arc::clone(&p));
        Arc::make_mut(&mut self.all).push(p);
    }

    fn add_primitive(&mut self, value: Option<Value>, quad: QuadIds) -> (u64, PrimRef) {
        self.last += 1;
        let id = self.last;
        let p = Arc::new(MemPrimitive {
            id,
            quad,
            value,
            refs: AtomicI64::new(1),
        });
        self.append_primitive(Arc::clone(&p));
        (id, p)
    }

    /// Adds an anonymous node, returning its id.
    pub fn add_bnode(&mut self) -> u64 {
        self.add_primitive(None, QuadIds::default()).0
    }

    /// Interns a value, returning its id and whether it was newly created.
    pub fn add_value(&mut self, v: &Value) -> (u64, bool) {
        let (id, exists) = self.resolve_val(v, true);
        (id, !exists)
    }

    /// Resolves a value to an id. With `add` set, missing values are
    /// created and reuse bumps the node's refcount.
    fn resolve_val(&mut self, v: &Value, add: bool) -> (u64, bool) {
        if let Value::Bnode(name) = v {
            if let Some(rest) = name.strip_prefix(INTERNAL_BNODE_PREFIX) {
                if let Ok(id) = rest.parse::<u64>() {
                    if id != 0 {
                        if let Some(p) = self.prim.get(&id) {
                            if add {
                                p.refs.fetch_add(1, AtomicOrdering::Relaxed);
                            }
                            return (id, true);
                        }
                        if !add {
                            return (id, false);
                        }
                        // resurrect the anonymous node under its old id
                        let p = Arc::new(MemPrimitive {
                            id,
                            quad: QuadIds::default(),
                            value: None,
                            refs: AtomicI64::new(1),
                        });
                        self.append_primitive(p);
                        return (id, true);
                    }
                }
            }
        }
        let vs = v.to_string();
        if let Some(&id) = self.vals.get(&vs) {
            if add {
                if let Some(p) = self.prim.get(&id) {
                    p.refs.fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
            return (id, true);
        }
        if !add {
            return (0, false);
        }
        let (id, _) = self.add_primitive(Some(v.clone()), QuadIds::default());
        self.vals.insert(vs, id);
        (id, true)
    }

    fn resolve_quad(&mut self, q: &Quad, add: bool) -> Option<QuadIds> {
        let mut p = QuadIds::default();
        for dir in Direction::ALL {
            let Some(v) = q.get(dir) else { continue };
            let (vid, _) = self.resolve_val(v, add);
            if vid != 0 {
                p.set(dir, vid);
            } else if !add {
                return None;
            }
        }
        Some(p)
    }

    fn lookup_val(&self, id: u64) -> Value {
        match self.prim.get(&id).and_then(|p| p.value.clone()) {
            Some(v) => v,
            None => Value::bnode(format!("{INTERNAL_BNODE_PREFIX}{id}")),
        }
    }

    fn lookup_quad_dirs(&self, ids: QuadIds) -> Quad {
        let mut q = Quad::default();
        for dir in Direction::ALL {
            let vid = ids.get(dir);
            if vid == 0 {
                continue;
            }
            q.set(dir, Some(self.lookup_val(vid)));
        }
        q
    }

    /// Adds a quad, returning its id and whether it was newly created.
    pub fn add_quad(&mut self, q: Quad) -> (u64, bool) {
        if let Some(p) = self.resolve_quad(&q, false) {
            if let Some(&id) = self.quads.get(&p) {
                if id != 0 {
                    return (id, false);
                }
            }
        }
        let p = self
            .resolve_quad(&q, true)
            .expect("resolution with add never fails");
        let (id, pr) = self.add_primitive(None, p);
        self.quads.insert(p, id);
        for dir in Direction::ALL {
            let v = p.get(dir);
            if v == 0 {
                continue;
            }
            self.index.tree(dir, v).set(id as i64, Arc::clone(&pr));
        }
        (id, true)
    }

    /// Looks a quad up without creating anything.
    pub fn find_quad(&mut self, q: &Quad) -> Option<(u64, QuadIds)> {
        let p = self.resolve_quad(q, false)?;
        match self.quads.get(&p) {
            Some(&id) if id != 0 => Some((id, p)),
            _ => None,
        }
    }

    /// Removes the primitive under `id` and unreferences the nodes of its
    /// directions, cascading into nodes whose refcount reaches zero.
    pub fn delete(&mut self, id: u64) -> bool {
        let Some(p) = self.prim.get(&id).cloned() else {
            return false;
        };
        if let Some(v) = &p.value {
            self.vals.remove(&v.to_string());
        }
        for dir in Direction::ALL {
            let v = p.quad.get(dir);
            if v == 0 {
                continue;
            }
            if let Some(t) = self.index.get_mut(dir, v) {
                t.delete(id as i64);
            }
        }
        self.quads.remove(&p.quad);
        self.prim.remove(&id);
        if let Some(pos) = self.all.iter().position(|x| Arc::ptr_eq(x, &p)) {
            Arc::make_mut(&mut self.all).remove(pos);
        }
        self.delete_quad_nodes(p.quad);
        true
    }

    fn delete_quad_nodes(&mut self, q: QuadIds) {
        for dir in Direction::ALL {
            let id = q.get(dir);
            if id == 0 {
                continue;
            }
            if let Some(p) = self.prim.get(&id) {
                let refs = p.refs.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
                debug_assert!(refs >= 0, "unreference of removed node {id}");
                if refs == 0 {
                    self.delete(id);
                }
            }
        }
    }

    /// Transaction counter, advanced once per applied batch.
    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Snapshot iterator over all quads.
    pub fn quads_all_iterator(&self) -> AllIterator {
        AllIterator {
            all: Arc::clone(&self.all),
            i: 0,
            nodes: false,
            maxid: self.last,
        }
    }

    /// Snapshot iterator over all primitives addressed as nodes.
    pub fn nodes_all_iterator(&self) -> AllIterator {
        AllIterator {
            all: Arc::clone(&self.all),
            i: 0,
            nodes: true,
            maxid: self.last,
        }
    }
}

impl QuadStore for MemStore {
    fn value_of(&self, v: &Value) -> Result<Option<Ref>> {
        match self.vals.get(&v.to_string()) {
            Some(&id) if id != 0 => Ok(Some(Ref::Node(id))),
            _ => Ok(None),
        }
    }

    fn name_of(&self, r: &Ref) -> Result<Option<Value>> {
        let id = r.id();
        if id == 0 || !self.prim.contains_key(&id) {
            return Ok(None);
        }
        Ok(Some(self.lookup_val(id)))
    }

    fn quad(&self, r: &Ref) -> Result<Quad> {
        let ids = match r {
            Ref::Quad { dirs, .. } => *dirs,
            Ref::Node(id) => self
                .prim
                .get(id)
                .map(|p| p.quad)
                .unwrap_or_default(),
        };
        if ids.is_zero() {
            return Ok(Quad::default());
        }
        Ok(self.lookup_quad_dirs(ids))
    }

    fn quad_direction(&self, r: &Ref, d: Direction) -> Result<Option<Ref>> {
        let ids = match r {
            Ref::Quad { dirs, .. } => *dirs,
            Ref::Node(id) => self
                .prim
                .get(id)
                .map(|p| p.quad)
                .unwrap_or_default(),
        };
        let id = ids.get(d);
        if id == 0 {
            return Ok(None);
        }
        Ok(Some(Ref::Node(id)))
    }

    fn quad_iterator(&self, d: Direction, r: &Ref) -> Result<QuadRefIter> {
        let Some(tree) = self.index.get(d, r.id()) else {
            return Ok(QuadRefIter::empty());
        };
        let refs = tree
            .iter()
            .map(|(k, p)| Ref::Quad {
                id: k as u64,
                dirs: p.quad,
            })
            .collect();
        Ok(QuadRefIter::new(refs))
    }

    fn quad_iterator_size(&self, d: Direction, r: &Ref) -> Result<Size> {
        let value = self
            .index
            .get(d, r.id())
            .map_or(0, |t| t.len() as i64);
        Ok(Size { value, exact: true })
    }

    fn apply_deltas(&mut self, deltas: &[Delta], opts: IgnoreOpts) -> Result<()> {
        // precheck the whole batch before touching anything
        if !opts.ignore_dup || !opts.ignore_missing {
            for d in deltas {
                match d.action {
                    Action::Add => {
                        if !opts.ignore_dup && self.find_quad(&d.quad).is_some() {
                            return Err(StoreError::for_delta(d.clone(), StoreError::QuadExists));
                        }
                    }
                    Action::Delete => {
                        if !opts.ignore_missing && self.find_quad(&d.quad).is_none() {
                            return Err(StoreError::for_delta(d.clone(), StoreError::QuadNotExist));
                        }
                    }
                }
            }
        }
        for d in deltas {
            match d.action {
                Action::Add => {
                    self.add_quad(d.quad.clone());
                }
                Action::Delete => {
                    if let Some((id, _)) = self.find_quad(&d.quad) {
                        self.delete(id);
                    }
                }
            }
        }
        self.horizon += 1;
        debug!(deltas = deltas.len(), quads = self.quads.len(), "applied deltas");
        Ok(())
    }

    fn stats(&self, _exact: bool) -> Result<Stats> {
        Ok(Stats {
            nodes: Size {
                value: self.vals.len() as i64,
                exact: true,
            },
            quads: Size {
                value: self.quads.len() as i64,
                exact: true,
            },
        })
    }

    fn new_quad_writer(&mut self) -> Result<Box<dyn QuadWriter + '_>> {
        Ok(Box::new(MemQuadWriter { qs: self }))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemQuadWriter<'a> {
    qs: &'a mut MemStore,
}

impl QuadWriter for MemQuadWriter<'_> {
    fn write_quads(&mut self, quads: &[Quad]) -> Result<usize> {
        for q in quads {
            self.qs.add_quad(q.clone());
        }
        Ok(quads.len())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Snapshot iterator over the append list.
pub struct AllIterator {
    all: Arc<Vec<PrimRef>>,
    i: usize,
    nodes: bool,
    maxid: u64,
}

impl Iterator for AllIterator {
    type Item = Ref;

    fn next(&mut self) -> Option<Ref> {
        while self.i < self.all.len() {
            let p = &self.all[self.i];
            self.i += 1;
            if p.id > self.maxid {
                continue;
            }
            if self.nodes {
                return Some(Ref::Node(p.id));
            }
            if !p.quad.is_zero() {
                return Some(Ref::Quad {
                    id: p.id,
                    dirs: p.quad,
                });
            }
        }
        None
    }
}

/// Builds a new in-memory store from options. The in-memory store takes
/// no options today; the signature matches the persistent store's
/// constructor for registration-style call sites.
pub fn new_quad_store(_opt: &Options) -> MemStore {
    MemStore::new()
}
