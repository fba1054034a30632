//! Index maintenance for the persistent quad store: bucket keys, the
//! buffered index writer, node refcounts, existence probing and the delta
//! application paths.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::graph::{Delta, IgnoreOpts};
use crate::kv::{self, KvTx};
use crate::model::{Direction, Value, ValueHash};

use super::deltas::{Deltas, NodeUpdate};
use super::primitive::{unix_nanos, Primitive};
use super::{KvQuadStore, WriterState, MAP_BLOOM_FP, MAP_BLOOM_N};

pub(super) const META_BUCKET: &[u8] = b"meta";
pub(super) const LOG_BUCKET: &[u8] = b"log";

/// The index set used before index metadata was recorded on disk.
pub fn legacy_quad_indexes() -> Vec<QuadIndex> {
    vec![
        QuadIndex {
            dirs: vec![Direction::Subject],
            unique: false,
        },
        QuadIndex {
            dirs: vec![Direction::Object],
            unique: false,
        },
    ]
}

pub fn default_quad_indexes() -> Vec<QuadIndex> {
    vec![
        // Optimizes forward traversals; all relations of a node are one
        // prefix scan away.
        QuadIndex {
            dirs: vec![Direction::Subject, Direction::Predicate],
            unique: false,
        },
        // Helps reverse traversals and full quad lookups, and keeps
        // super-nodes (values with a high in-degree) off the hot path.
        QuadIndex {
            dirs: vec![Direction::Object, Direction::Predicate, Direction::Subject],
            unique: false,
        },
    ]
}

/// A composite index over quads: an ordered list of directions plus a
/// uniqueness flag. The index maps the big-endian concatenation of the
/// direction ids to an append-only varint list of quad ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadIndex {
    pub dirs: Vec<Direction>,
    #[serde(default)]
    pub unique: bool,
}

impl QuadIndex {
    /// The bucket prefix, one byte per direction.
    pub fn bucket(&self) -> Vec<u8> {
        self.dirs.iter().map(|d| d.prefix()).collect()
    }

    /// The key for an explicit id tuple.
    pub fn key(&self, vals: &[u64]) -> Vec<u8> {
        let mut tail = Vec::with_capacity(8 * vals.len());
        for v in vals {
            tail.extend_from_slice(&v.to_be_bytes());
        }
        kv::bucket_key(&self.bucket(), &tail)
    }

    /// The key under which `p` is indexed.
    pub fn key_for(&self, p: &Primitive) -> Vec<u8> {
        kv::bucket_key(&self.bucket(), &self.key_tail_for(p))
    }

    pub(super) fn key_tail_for(&self, p: &Primitive) -> Vec<u8> {
        let mut tail = Vec::with_capacity(8 * self.dirs.len());
        for d in &self.dirs {
            tail.extend_from_slice(&p.get_direction(*d).to_be_bytes());
        }
        tail
    }
}

// ---- bucket keys ----

pub(super) fn meta_key(name: &str) -> Vec<u8> {
    kv::bucket_key(META_BUCKET, name.as_bytes())
}

pub(super) fn log_key(id: u64) -> Vec<u8> {
    kv::bucket_key(LOG_BUCKET, &id.to_be_bytes())
}

pub(super) fn bucket_for_val(i: u8, j: u8) -> Vec<u8> {
    vec![b'v', i, j]
}

pub(super) fn bucket_for_val_refs(i: u8, j: u8) -> Vec<u8> {
    vec![b'n', i, j]
}

pub(super) fn bucket_key_for_hash(h: &ValueHash) -> Vec<u8> {
    kv::bucket_key(&bucket_for_val(h.0[0], h.0[1]), h.as_bytes())
}

pub(super) fn bucket_key_for_hash_refs(h: &ValueHash) -> Vec<u8> {
    kv::bucket_key(&bucket_for_val_refs(h.0[0], h.0[1]), h.as_bytes())
}

/// The 24-byte subject/predicate/object key fed to the existence bloom.
pub(super) fn exists_key(p: &Primitive) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[0..8].copy_from_slice(&p.subject.to_be_bytes());
    buf[8..16].copy_from_slice(&p.predicate.to_be_bytes());
    buf[16..24].copy_from_slice(&p.object.to_be_bytes());
    buf
}

// ---- varints ----

pub(super) fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

pub(super) fn uvarint_bytes(x: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    put_uvarint(&mut buf, x);
    buf
}

/// Decodes one varint, returning the value and the bytes consumed.
pub(super) fn uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(StoreError::Corruption("varint overflow".into()));
        }
        x |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((x, i + 1));
        }
        shift += 7;
    }
    Err(StoreError::Corruption("truncated varint".into()))
}

pub(super) fn decode_index(mut b: &[u8]) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    while !b.is_empty() {
        let (v, n) = uvarint(b)?;
        out.push(v);
        b = &b[n..];
    }
    Ok(out)
}

pub(super) fn count_index(mut b: &[u8]) -> Result<i64> {
    let mut cnt = 0i64;
    while !b.is_empty() {
        let (_, n) = uvarint(b)?;
        cnt += 1;
        b = &b[n..];
    }
    Ok(cnt)
}

pub(super) fn append_index(existing: Option<&[u8]>, ids: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(existing.map_or(0, |b| b.len()) + 10 * ids.len());
    if let Some(b) = existing {
        buf.extend_from_slice(b);
    }
    for &id in ids {
        put_uvarint(&mut buf, id);
    }
    buf
}

pub(super) fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::new();
    let mut j = 0usize;
    'outer: for &x in a {
        loop {
            if j >= b.len() {
                break 'outer;
            }
            if x > b[j] {
                j += 1;
                continue;
            }
            if x == b[j] {
                out.push(x);
                j += 1;
            }
            break;
        }
    }
    out
}

// ---- metadata ints ----

pub(super) fn as_i64(b: &[u8], empty: i64) -> Result<i64> {
    if b.is_empty() {
        return Ok(empty);
    }
    let bytes: [u8; 8] = b
        .try_into()
        .map_err(|_| StoreError::Corruption(format!("unexpected int size: {}", b.len())))?;
    Ok(i64::from_le_bytes(bytes))
}

pub(super) fn get_meta_int_tx(tx: &dyn KvTx, key: &str) -> Result<i64> {
    let val = tx.get(&meta_key(key))?.ok_or(StoreError::NoBucket)?;
    as_i64(&val, 0)
}

/// Adds `n` to a metadata counter, returning its previous value. A
/// missing counter starts at zero.
pub(super) fn inc_meta_int(tx: &mut dyn KvTx, key: &str, n: i64) -> Result<i64> {
    if n == 0 {
        return Ok(0);
    }
    let start = match get_meta_int_tx(&*tx, key) {
        Ok(v) => v,
        Err(StoreError::NoBucket) => 0,
        Err(e) => return Err(e),
    };
    let v = start + n;
    tx.put(&meta_key(key), &(v as u64).to_le_bytes())?;
    Ok(start)
}

/// Allocates `n` contiguous ids, returning the first.
pub(super) fn gen_ids(tx: &mut dyn KvTx, n: usize) -> Result<u64> {
    if n == 0 {
        return Ok(0);
    }
    let start = inc_meta_int(tx, "horizon", n as i64)?;
    Ok(start as u64 + 1)
}

fn inc_size(tx: &mut dyn KvTx, n: i64) -> Result<()> {
    inc_meta_int(tx, "size", n).map(|_| ())
}

// ---- log ----

pub(super) fn add_to_log(tx: &mut dyn KvTx, p: &Primitive) -> Result<()> {
    tx.put(&log_key(p.id), &p.encode())
}

fn del_log(tx: &mut dyn KvTx, id: u64) -> Result<()> {
    tx.del(&log_key(id))
}

#[derive(Debug, Clone, Copy)]
pub(super) struct ResolvedNode {
    pub id: u64,
    pub new: bool,
}

/// A node refcount change with its resolved id.
#[derive(Debug, Clone)]
struct NodeChange {
    id: u64,
    hash: ValueHash,
    val: Value,
    ref_inc: i64,
}

impl KvQuadStore {
    /// Resolves the values of node updates to ids, via the LRU, the
    /// node-presence bloom and one batched bucket read. `fnc` is invoked
    /// for every update; 0 means unresolved.
    pub(super) fn resolve_val_deltas(
        &self,
        tx: &dyn KvTx,
        state: Option<&WriterState>,
        deltas: &[NodeUpdate],
        mut fnc: impl FnMut(usize, u64),
    ) -> Result<()> {
        let mut inds = Vec::with_capacity(deltas.len());
        let mut keys = Vec::with_capacity(deltas.len());
        for (i, d) in deltas.iter().enumerate() {
            if let Value::Iri(iri) = &d.val {
                if let Some(id) = self.value_lru.get(iri) {
                    fnc(i, id);
                    continue;
                }
            }
            if let Some(nodes) = state.and_then(|s| s.map_nodes.as_ref()) {
                if !nodes.test(d.hash.as_bytes()) {
                    fnc(i, 0);
                    continue;
                }
            }
            inds.push(i);
            keys.push(bucket_key_for_hash(&d.hash));
        }
        if keys.is_empty() {
            return Ok(());
        }
        let resp = tx.get_batch(&keys)?;
        for (j, b) in resp.iter().enumerate() {
            let i = inds[j];
            let id = match b {
                Some(b) if !b.is_empty() => uvarint(b)?.0,
                _ => 0,
            };
            if id != 0 {
                if let Value::Iri(iri) = &deltas[i].val {
                    self.value_lru.put(iri.clone(), id);
                }
            }
            fnc(i, id);
        }
        Ok(())
    }

    /// Applies refcount changes for known nodes and seeds counts for new
    /// ones. Returns the indices of `changes` whose count reached zero.
    fn inc_nodes_cnt(
        &self,
        tx: &mut dyn KvTx,
        changes: &[NodeChange],
        new_changes: &[NodeChange],
    ) -> Result<Vec<usize>> {
        let keys: Vec<Vec<u8>> = changes
            .iter()
            .map(|d| bucket_key_for_hash_refs(&d.hash))
            .collect();
        let sizes = tx.get_batch(&keys)?;
        let mut del = Vec::new();
        for (i, d) in changes.iter().enumerate() {
            let mut sz: i64 = 0;
            if let Some(b) = &sizes[i] {
                if !b.is_empty() {
                    sz = uvarint(b)?.0 as i64;
                }
            }
            sz += d.ref_inc;
            if sz <= 0 {
                tx.del(&keys[i])?;
                del.push(i);
                continue;
            }
            tx.put(&keys[i], &uvarint_bytes(sz as u64))?;
        }
        for d in new_changes {
            tx.put(
                &bucket_key_for_hash_refs(&d.hash),
                &uvarint_bytes(d.ref_inc as u64),
            )?;
        }
        Ok(del)
    }

    /// Resolves or creates the nodes of the increment updates, bumping
    /// refcounts, and reports the id of each hash and whether it is new.
    pub(super) fn inc_nodes(
        &self,
        tx: &mut dyn KvTx,
        state: &mut WriterState,
        deltas: &[NodeUpdate],
    ) -> Result<HashMap<ValueHash, ResolvedNode>> {
        let mut ins: Vec<NodeChange> = Vec::new();
        let mut upd: Vec<NodeChange> = Vec::with_capacity(deltas.len());
        let mut ids = HashMap::with_capacity(deltas.len());
        self.resolve_val_deltas(&*tx, Some(&*state), deltas, |i, id| {
            let d = &deltas[i];
            let change = NodeChange {
                id,
                hash: d.hash,
                val: d.val.clone(),
                ref_inc: d.ref_inc,
            };
            if id == 0 {
                ins.push(change);
            } else {
                ids.insert(d.hash, ResolvedNode { id, new: false });
                upd.push(change);
            }
        })?;
        if !ins.is_empty() {
            let start = gen_ids(tx, ins.len())?;
            for (i, iv) in ins.iter_mut().enumerate() {
                let id = start + i as u64;
                let mut node = Primitive::node(&iv.val);
                node.id = id;
                ids.insert(iv.hash, ResolvedNode { id, new: true });
                self.index_node(tx, state, &node, &iv.val)?;
                iv.id = id;
            }
        }
        self.inc_nodes_cnt(tx, &upd, &ins)?;
        Ok(ids)
    }

    /// Decrements refcounts of resolved nodes; a node reaching zero loses
    /// its value mapping, its LRU entry and its log record.
    pub(super) fn dec_nodes(
        &self,
        tx: &mut dyn KvTx,
        deltas: &[NodeUpdate],
        nodes: &HashMap<ValueHash, u64>,
    ) -> Result<()> {
        let mut upds: Vec<NodeChange> = Vec::with_capacity(deltas.len());
        for d in deltas {
            let id = nodes.get(&d.hash).copied().unwrap_or(0);
            if id == 0 || d.ref_inc == 0 {
                continue;
            }
            upds.push(NodeChange {
                id,
                hash: d.hash,
                val: d.val.clone(),
                ref_inc: d.ref_inc,
            });
        }
        let del = self.inc_nodes_cnt(tx, &upds, &[])?;
        for i in del {
            let d = &upds[i];
            tx.del(&bucket_key_for_hash(&d.hash))?;
            if let Value::Iri(iri) = &d.val {
                self.value_lru.del(iri);
            }
            del_log(tx, d.id)?;
        }
        Ok(())
    }

    /// Writes a node primitive: its value mapping, the LRU and presence
    /// bloom entries, and the log record.
    fn index_node(
        &self,
        tx: &mut dyn KvTx,
        state: &mut WriterState,
        p: &Primitive,
        val: &Value,
    ) -> Result<()> {
        let hash = val.hash();
        tx.put(&bucket_key_for_hash(&hash), &uvarint_bytes(p.id))?;
        if let Value::Iri(iri) = val {
            self.value_lru.put(iri.clone(), p.id);
        }
        if let Some(nodes) = &mut state.map_nodes {
            nodes.add(hash.as_bytes());
        }
        add_to_log(tx, p)
    }

    fn index_links(
        &self,
        tx: &mut dyn KvTx,
        state: &mut WriterState,
        links: &[Primitive],
    ) -> Result<()> {
        for p in links {
            self.index_link(tx, state, p)?;
        }
        inc_size(tx, links.len() as i64)
    }

    /// Buffers index entries for one quad primitive, registers it in the
    /// existence bloom and appends it to the log.
    fn index_link(
        &self,
        tx: &mut dyn KvTx,
        state: &mut WriterState,
        p: &Primitive,
    ) -> Result<()> {
        let all = self.indexes.read().all.clone();
        for ind in &all {
            state.add_to_map_bucket(ind.bucket(), ind.key_tail_for(p), p.id);
        }
        self.bloom_add(p);
        add_to_log(tx, p)
    }

    fn mark_links_dead(&self, tx: &mut dyn KvTx, links: &mut [Primitive]) -> Result<()> {
        for p in links.iter_mut() {
            p.deleted = true;
            self.bloom_remove(p);
            add_to_log(tx, p)?;
        }
        inc_size(tx, -(links.len() as i64))
    }

    pub(super) fn get_primitives_from_log(
        &self,
        tx: &dyn KvTx,
        ids: &[u64],
    ) -> Result<Vec<Option<Primitive>>> {
        let keys: Vec<Vec<u8>> = ids.iter().map(|&id| log_key(id)).collect();
        let vals = tx.get_batch(&keys)?;
        let mut out = Vec::with_capacity(ids.len());
        for v in vals {
            match v {
                Some(v) if !v.is_empty() => out.push(Some(Primitive::decode(&v)?)),
                _ => out.push(None),
            }
        }
        Ok(out)
    }

    pub(super) fn get_primitive_from_log(
        &self,
        tx: &dyn KvTx,
        id: u64,
    ) -> Result<Option<Primitive>> {
        Ok(self.get_primitives_from_log(tx, &[id])?.pop().flatten())
    }

    fn get_bucket_indexes(&self, tx: &dyn KvTx, keys: &[Vec<u8>]) -> Result<Vec<Vec<u64>>> {
        let vals = tx.get_batch(keys)?;
        let mut out = Vec::with_capacity(keys.len());
        for v in vals {
            match v {
                Some(v) if !v.is_empty() => out.push(decode_index(&v)?),
                _ => out.push(Vec::new()),
            }
        }
        Ok(out)
    }

    /// The index set used for duplicate detection: the first unique index
    /// if one exists, otherwise all indexes intersected. Cached.
    fn best_unique(&self) -> Result<Vec<QuadIndex>> {
        {
            let idx = self.indexes.read();
            if !idx.exists.is_empty() {
                return Ok(idx.exists.clone());
            }
        }
        let mut idx = self.indexes.write();
        if !idx.exists.is_empty() {
            return Ok(idx.exists.clone());
        }
        if let Some(unique) = idx.all.iter().find(|ind| ind.unique).cloned() {
            debug!(dirs = ?unique.dirs, "using unique index");
            idx.exists = vec![unique];
            return Ok(idx.exists.clone());
        }
        if idx.all.is_empty() {
            return Err(StoreError::Corruption("no indexes defined".into()));
        }
        debug!("using index intersection");
        idx.exists = idx.all.clone();
        Ok(idx.exists.clone())
    }

    /// The most specific index for the constrained directions; an exact
    /// prefix match wins outright.
    pub(super) fn best_indexes(&self, dirs: &[Direction]) -> Vec<QuadIndex> {
        let all = self.indexes.read().all.clone();
        let mut max = 0usize;
        let mut best: Option<QuadIndex> = None;
        for ind in all {
            if ind.dirs.len() < dirs.len() {
                continue;
            }
            let mut matched = 0usize;
            for (i, d) in ind.dirs.iter().enumerate() {
                if i >= dirs.len() || !dirs.contains(d) {
                    break;
                }
                matched += 1;
            }
            if matched == dirs.len() {
                return vec![ind];
            }
            if matched > 0 && matched > max {
                max = matched;
                best = Some(ind);
            }
        }
        match best {
            Some(ind) => vec![ind],
            None => Vec::new(),
        }
    }

    /// Checks whether a quad with the candidate's direction ids exists.
    ///
    /// The bloom answers "definitely absent" cheaply; otherwise the best
    /// indexes are intersected and, unless a unique index answered and
    /// `get` is unset, candidates are probed in the log newest first,
    /// skipping tombstones.
    pub(super) fn has_primitive(
        &self,
        tx: &dyn KvTx,
        p: &Primitive,
        get: bool,
    ) -> Result<Option<Primitive>> {
        if !self.test_bloom(p) {
            return Ok(None);
        }
        let inds = self.best_unique()?;
        let unique = inds.first().is_some_and(|i| i.unique);
        let keys: Vec<Vec<u8>> = inds.iter().map(|ind| ind.key_for(p)).collect();
        let lists = self.get_bucket_indexes(tx, &keys)?;
        let mut lists = lists.into_iter();
        let mut options = lists.next().unwrap_or_default();
        for b in lists {
            options = intersect_sorted(&options, &b);
        }
        if !get && unique {
            return Ok(Some(p.clone()));
        }
        for &id in options.iter().rev() {
            let Some(prim) = self.get_primitive_from_log(tx, id)? else {
                continue;
            };
            if prim.deleted {
                continue;
            }
            if prim.is_same_link(p) {
                return Ok(Some(prim));
            }
        }
        Ok(None)
    }

    /// Sorted, bloom-aware flush of the buffered index entries. Keys that
    /// may already exist are batch-read and appended to; first writes skip
    /// the read.
    pub(super) fn flush_map_bucket(
        &self,
        tx: &mut dyn KvTx,
        state: &mut WriterState,
    ) -> Result<()> {
        let map = std::mem::take(&mut state.map_bucket);
        let mut buckets: Vec<&Vec<u8>> = map.keys().collect();
        buckets.sort();
        for bucket in buckets {
            let m = &map[bucket];
            if m.is_empty() {
                continue;
            }
            let mut keys: Vec<(Vec<u8>, &Vec<u8>)> = Vec::new();
            let mut keys_put: Vec<(Vec<u8>, &Vec<u8>)> = Vec::new();
            for tail in m.keys() {
                let full = kv::bucket_key(bucket, tail);
                let fresh = match &state.map_bloom {
                    Some(blooms) => blooms.get(bucket).map_or(true, |b| !b.test(tail)),
                    None => false,
                };
                if fresh {
                    keys_put.push((full, tail));
                } else {
                    keys.push((full, tail));
                }
            }
            keys.sort();
            keys_put.sort();
            let read_keys: Vec<Vec<u8>> = keys.iter().map(|(k, _)| k.clone()).collect();
            let vals = tx.get_batch(&read_keys)?;
            let mut bloom = match &mut state.map_bloom {
                Some(blooms) => Some(
                    blooms
                        .entry(bucket.clone())
                        .or_insert_with(|| super::bloom::BloomFilter::new(MAP_BLOOM_N, MAP_BLOOM_FP)),
                ),
                None => None,
            };
            for (full, tail) in &keys_put {
                tx.put(full, &append_index(None, &m[*tail]))?;
                if let Some(b) = &mut bloom {
                    b.add(tail);
                }
            }
            for (i, (full, tail)) in keys.iter().enumerate() {
                let buf = append_index(vals[i].as_deref(), &m[*tail]);
                tx.put(full, &buf)?;
                if let Some(b) = &mut bloom {
                    b.add(tail);
                }
            }
            debug!(
                bucket = %String::from_utf8_lossy(bucket),
                entries = m.len(),
                "flushed index bucket"
            );
        }
        Ok(())
    }

    /// First phase of delta application: create or resolve nodes, then
    /// materialize the surviving new quads, buffering their index entries.
    pub(super) fn apply_add_deltas(
        &self,
        tx: &mut dyn KvTx,
        state: &mut WriterState,
        in_deltas: &[Delta],
        deltas: &mut Deltas,
        opts: IgnoreOpts,
    ) -> Result<HashMap<ValueHash, ResolvedNode>> {
        let nodes = self.inc_nodes(tx, state, &deltas.inc_node)?;
        deltas.inc_node.clear();

        let mut links: Vec<Primitive> = Vec::with_capacity(deltas.quad_add.len());
        let mut qadd: HashSet<[u64; 4]> = HashSet::with_capacity(deltas.quad_add.len());
        for q in &deltas.quad_add {
            let mut link = Primitive::default();
            let mut must_be_new = false;
            let mut qkey = [0u64; 4];
            for (i, dir) in Direction::ALL.iter().enumerate() {
                let Some(h) = &q.quad[i] else { continue };
                let Some(n) = nodes.get(h) else { continue };
                must_be_new = must_be_new || n.new;
                link.set_direction(*dir, n.id);
                qkey[i] = n.id;
            }
            if !qadd.insert(qkey) {
                continue;
            }
            if !must_be_new {
                if self.has_primitive(&*tx, &link, false)?.is_some() {
                    if opts.ignore_dup {
                        continue;
                    }
                    if in_deltas.is_empty() {
                        return Err(StoreError::QuadExists);
                    }
                    return Err(StoreError::for_delta(
                        in_deltas[q.ind].clone(),
                        StoreError::QuadExists,
                    ));
                }
            }
            links.push(link);
        }
        deltas.quad_add.clear();

        let qstart = gen_ids(tx, links.len())?;
        for (i, link) in links.iter_mut().enumerate() {
            link.id = qstart + i as u64;
            link.timestamp = unix_nanos();
        }
        self.index_links(tx, state, &links)?;
        Ok(nodes)
    }

    /// The full delta application algorithm, inside one write transaction.
    pub(super) fn apply_deltas_locked(
        &self,
        state: &mut WriterState,
        in_deltas: &[Delta],
        opts: IgnoreOpts,
    ) -> Result<()> {
        let mut tx = self.db.tx(true)?;
        let mut deltas = super::deltas::split_deltas(in_deltas);
        let has_deletions = !deltas.quad_del.is_empty() || !deltas.dec_node.is_empty();
        if has_deletions {
            // first-write tracking is only sound while nothing is removed
            state.map_nodes = None;
        }

        let nodes = self.apply_add_deltas(tx.as_mut(), state, in_deltas, &mut deltas, opts)?;

        if has_deletions {
            let mut dnodes: HashMap<ValueHash, u64> = HashMap::with_capacity(deltas.dec_node.len());
            {
                let dec = &deltas.dec_node;
                self.resolve_val_deltas(&*tx, Some(&*state), dec, |i, id| {
                    dnodes.insert(dec[i].hash, id);
                })?;
            }

            // verify existence and collect quads to tombstone
            let mut links: Vec<Primitive> = Vec::with_capacity(deltas.quad_del.len());
            let mut fix_nodes: HashMap<ValueHash, i64> = HashMap::new();
            for q in &deltas.quad_del {
                let mut link = Primitive::default();
                let mut exists = true;
                for (i, dir) in Direction::ALL.iter().enumerate() {
                    let Some(h) = &q.quad[i] else { continue };
                    let id = match nodes.get(h) {
                        Some(n) => n.id,
                        None => match dnodes.get(h) {
                            Some(&id) => id,
                            None => {
                                exists = false;
                                continue;
                            }
                        },
                    };
                    link.set_direction(*dir, id);
                }
                if exists {
                    match self.has_primitive(&*tx, &link, true)? {
                        Some(p) if !p.deleted => link = p,
                        _ => exists = false,
                    }
                }
                if !exists {
                    if !opts.ignore_missing {
                        return Err(StoreError::for_delta(
                            in_deltas[q.ind].clone(),
                            StoreError::QuadNotExist,
                        ));
                    }
                    // refund the refcounts decremented for this quad
                    for h in q.quad.iter().flatten() {
                        *fix_nodes.entry(*h).or_insert(0) += 1;
                    }
                    continue;
                }
                links.push(link);
            }
            self.mark_links_dead(tx.as_mut(), &mut links)?;

            if !fix_nodes.is_empty() {
                for n in &mut deltas.dec_node {
                    if let Some(&dn) = fix_nodes.get(&n.hash) {
                        if dn != 0 {
                            n.ref_inc += dn;
                        }
                    }
                }
            }
            self.dec_nodes(tx.as_mut(), &deltas.dec_node, &dnodes)?;
        }

        self.flush_map_bucket(tx.as_mut(), state)?;
        tx.commit()
    }

    // ---- existence bloom ----

    pub(super) fn test_bloom(&self, p: &Primitive) -> bool {
        match &self.exists {
            None => true, // disabled: false positives are expected
            Some(filter) => filter.lock().test(&exists_key(p)),
        }
    }

    fn bloom_add(&self, p: &Primitive) {
        if let Some(filter) = &self.exists {
            filter.lock().add(&exists_key(p));
        }
    }

    fn bloom_remove(&self, p: &Primitive) {
        if let Some(filter) = &self.exists {
            filter.lock().test_and_remove(&exists_key(p));
        }
    }
}

impl WriterState {
    fn add_to_map_bucket(&mut self, bucket: Vec<u8>, key_tail: Vec<u8>, id: u64) {
        self.map_bucket
            .entry(bucket)
            .or_default()
            .entry(key_tail)
            .or_default()
            .push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for x in [0u64, 1, 127, 128, 300, u64::MAX] {
            let b = uvarint_bytes(x);
            let (y, n) = uvarint(&b).expect("decode");
            assert_eq!(x, y);
            assert_eq!(n, b.len());
        }
        assert!(matches!(uvarint(&[0x80]), Err(StoreError::Corruption(_))));
        let overlong = [0xFFu8; 11];
        assert!(matches!(uvarint(&overlong), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn index_list_append_and_decode() {
        let buf = append_index(None, &[1, 5, 300]);
        let more = append_index(Some(&buf), &[301]);
        assert_eq!(decode_index(&more).expect("decode"), vec![1, 5, 300, 301]);
        assert_eq!(count_index(&more).expect("count"), 4);
    }

    #[test]
    fn sorted_intersection() {
        assert_eq!(intersect_sorted(&[1, 3, 5, 7], &[2, 3, 5, 8]), vec![3, 5]);
        assert_eq!(intersect_sorted(&[], &[1]), Vec::<u64>::new());
        assert_eq!(intersect_sorted(&[1, 2], &[]), Vec::<u64>::new());
    }

    #[test]
    fn index_key_layout() {
        let ind = QuadIndex {
            dirs: vec![Direction::Subject, Direction::Predicate],
            unique: false,
        };
        assert_eq!(ind.bucket(), b"sp".to_vec());
        let key = ind.key(&[1, 2]);
        let mut want = b"sp\x00".to_vec();
        want.extend_from_slice(&1u64.to_be_bytes());
        want.extend_from_slice(&2u64.to_be_bytes());
        assert_eq!(key, want);
    }

    #[test]
    fn index_metadata_json_shape() {
        let inds = default_quad_indexes();
        let json = serde_json::to_string(&inds).expect("encode");
        assert!(json.contains("\"subject\""));
        let back: Vec<QuadIndex> = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, inds);
        // the unique flag is optional on decode
        let legacy: Vec<QuadIndex> =
            serde_json::from_str(r#"[{"dirs":["subject"]}]"#).expect("decode");
        assert!(!legacy[0].unique);
    }
}
