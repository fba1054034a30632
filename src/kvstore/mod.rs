//! The persistent quad store, layered on an opaque ordered key-value
//! engine: a primitive log, value and refcount buckets, configurable
//! composite quad indexes, bloom-filter pruning and transactional delta
//! application.

pub mod bloom;
mod deltas;
mod indexing;
mod primitive;

pub use indexing::{default_quad_indexes, legacy_quad_indexes, QuadIndex};
pub use primitive::Primitive;

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::graph::{
    Delta, IgnoreOpts, Options, QuadRefIter, QuadStore, QuadWriter, Ref, Size, Stats,
};
use crate::kv::{self, Kv, KvTx};
use crate::lru::ValueCache;
use crate::model::{Direction, Quad, Value};

use bloom::{BloomFilter, DeletableBloomFilter};
use indexing::{
    bucket_for_val, bucket_for_val_refs, exists_key, get_meta_int_tx, meta_key, LOG_BUCKET,
    META_BUCKET,
};

/// Current on-disk schema version.
pub const LATEST_DATA_VERSION: i64 = 2;

/// JSON document overriding the index set at `init` time.
pub const ENV_KV_INDEXES: &str = "CAYLEY_KV_INDEXES";

/// Eagerly create all value/refcount sub-buckets during `init`.
pub const OPT_UPFRONT: &str = "upfront";
/// Disable the existence bloom filter (everything possibly exists).
pub const OPT_NO_BLOOM: &str = "no_bloom";

const VALUE_LRU_SIZE: usize = 2000;
const EXISTS_BLOOM_N: usize = 100_000_000;
const EXISTS_BLOOM_REGIONS: u64 = 120;
const EXISTS_BLOOM_FP: f64 = 0.05;
pub(crate) const MAP_BLOOM_N: usize = 100_000_000;
pub(crate) const MAP_BLOOM_FP: f64 = 0.05;

/// Default write batch; the streaming writer commits every 20 batches.
pub const DEFAULT_BATCH: usize = 10_000;

#[derive(Debug, Default)]
pub(crate) struct IndexSet {
    all: Vec<QuadIndex>,
    /// Indexes used to detect duplicate quads, resolved lazily.
    exists: Vec<QuadIndex>,
}

/// State owned by the current writer: the buffered index entries and the
/// first-write filters that are only sound while the store grows from
/// empty.
pub(crate) struct WriterState {
    map_bucket: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u64>>>,
    map_bloom: Option<HashMap<Vec<u8>, BloomFilter>>,
    map_nodes: Option<BloomFilter>,
}

/// A quad store over an ordered key-value engine.
pub struct KvQuadStore {
    db: Box<dyn Kv>,
    indexes: RwLock<IndexSet>,
    value_lru: ValueCache,
    writer: Mutex<WriterState>,
    /// Deletable bloom over live (subject, predicate, object) triples;
    /// `None` when disabled via [`OPT_NO_BLOOM`].
    exists: Option<Mutex<DeletableBloomFilter>>,
}

#[derive(Deserialize)]
struct IndexesDoc {
    all: Vec<QuadIndex>,
}

/// Initializes empty storage: bucket sentinels, schema version and the
/// index definitions (from [`ENV_KV_INDEXES`] if set).
pub fn init(db: &dyn Kv, opt: &Options) -> Result<()> {
    let mut indexes = default_quad_indexes();
    if let Ok(data) = std::env::var(ENV_KV_INDEXES) {
        if !data.is_empty() {
            let doc: IndexesDoc = serde_json::from_str(&data)
                .map_err(|e| StoreError::Corruption(format!("cannot decode indexes: {e}")))?;
            if !doc.all.is_empty() {
                indexes = doc.all;
            }
        }
    }
    match get_version(db) {
        Ok(_) => return Err(StoreError::DatabaseExists),
        Err(StoreError::NoBucket) => {}
        Err(e) => return Err(e),
    }
    let upfront = opt.bool_key(OPT_UPFRONT, false);
    create_buckets(db, &indexes, upfront)?;
    set_version(db, LATEST_DATA_VERSION)?;
    write_indexes_meta(db, &indexes)?;
    info!(indexes = indexes.len(), "initialized quad store");
    Ok(())
}

/// Opens initialized storage, checking the schema version, loading the
/// index definitions and warming the existence bloom from the log.
pub fn open(db: Box<dyn Kv>, opt: &Options) -> Result<KvQuadStore> {
    let vers = match get_version(db.as_ref()) {
        Err(StoreError::NoBucket) => return Err(StoreError::NotInitialized),
        r => r?,
    };
    if vers != LATEST_DATA_VERSION {
        return Err(StoreError::VersionMismatch {
            stored: vers,
            supported: LATEST_DATA_VERSION,
        });
    }
    let list = read_indexes_meta(db.as_ref())?;
    let no_bloom = opt.bool_key(OPT_NO_BLOOM, false);
    let exists = if no_bloom {
        None
    } else {
        Some(Mutex::new(warm_exists_bloom(db.as_ref())?))
    };
    let size = get_size(db.as_ref())?;
    let (map_bloom, map_nodes) = if !no_bloom && size == 0 {
        (
            Some(HashMap::new()),
            Some(BloomFilter::new(MAP_BLOOM_N, MAP_BLOOM_FP)),
        )
    } else {
        (None, None)
    };
    debug!(size, indexes = list.len(), no_bloom, "opened quad store");
    Ok(KvQuadStore {
        db,
        indexes: RwLock::new(IndexSet {
            all: list,
            exists: Vec::new(),
        }),
        value_lru: ValueCache::new(VALUE_LRU_SIZE),
        writer: Mutex::new(WriterState {
            map_bucket: HashMap::new(),
            map_bloom,
            map_nodes,
        }),
        exists,
    })
}

fn create_buckets(db: &dyn Kv, indexes: &[QuadIndex], upfront: bool) -> Result<()> {
    kv::update(db, |tx| {
        kv::create_bucket(tx, META_BUCKET)?;
        kv::create_bucket(tx, LOG_BUCKET)?;
        for ind in indexes {
            kv::create_bucket(tx, &ind.bucket())?;
        }
        Ok(())
    })?;
    if !upfront {
        return Ok(());
    }
    for i in 0..=255u8 {
        kv::update(db, |tx| {
            for j in 0..=255u8 {
                kv::create_bucket(tx, &bucket_for_val(i, j))?;
                kv::create_bucket(tx, &bucket_for_val_refs(i, j))?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn get_version(db: &dyn Kv) -> Result<i64> {
    kv::view(db, |tx| get_meta_int_tx(tx, "version"))
}

fn set_version(db: &dyn Kv, version: i64) -> Result<()> {
    kv::update(db, |tx| {
        tx.put(&meta_key("version"), &(version as u64).to_le_bytes())
    })
}

fn write_indexes_meta(db: &dyn Kv, indexes: &[QuadIndex]) -> Result<()> {
    let data = serde_json::to_vec(indexes)
        .map_err(|e| StoreError::Corruption(format!("cannot encode indexes: {e}")))?;
    kv::update(db, |tx| tx.put(&meta_key("indexes"), &data))
}

/// Reads the index definitions; databases from before index metadata was
/// recorded get the legacy index set.
fn read_indexes_meta(db: &dyn Kv) -> Result<Vec<QuadIndex>> {
    kv::view(db, |tx| {
        let Some(data) = tx.get(&meta_key("indexes"))? else {
            return Ok(legacy_quad_indexes());
        };
        let out: Vec<QuadIndex> = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Corruption(format!("cannot decode indexes: {e}")))?;
        if out.is_empty() {
            return Ok(legacy_quad_indexes());
        }
        Ok(out)
    })
}

fn get_meta_int(db: &dyn Kv, key: &str) -> Result<i64> {
    kv::view(db, |tx| get_meta_int_tx(tx, key))
}

fn get_size(db: &dyn Kv) -> Result<i64> {
    match get_meta_int(db, "size") {
        Err(StoreError::NoBucket) => Ok(0),
        r => r,
    }
}

/// Rebuilds the existence bloom by scanning the log for live quads.
fn warm_exists_bloom(db: &dyn Kv) -> Result<DeletableBloomFilter> {
    let mut filter =
        DeletableBloomFilter::new(EXISTS_BLOOM_N, EXISTS_BLOOM_REGIONS, EXISTS_BLOOM_FP);
    let mut quads = 0usize;
    kv::view(db, |tx| {
        let prefix = kv::bucket_prefix(LOG_BUCKET);
        for pair in tx.scan(&prefix)? {
            let (k, v) = pair?;
            if k.len() == prefix.len() || v.is_empty() {
                continue; // bucket sentinel
            }
            let p = Primitive::decode(&v)?;
            if p.is_node() || p.deleted {
                continue;
            }
            filter.add(&exists_key(&p));
            quads += 1;
        }
        Ok(())
    })?;
    debug!(quads, "warmed existence bloom from log");
    Ok(filter)
}

impl KvQuadStore {
    /// Number of live quads, from metadata.
    pub fn size(&self) -> i64 {
        get_size(self.db.as_ref()).unwrap_or(0)
    }

    /// The last issued primitive id.
    pub fn horizon(&self) -> i64 {
        match get_meta_int(self.db.as_ref(), "horizon") {
            Ok(h) => h,
            Err(_) => 0,
        }
    }

    fn resolve_quad_value(&self, tx: &dyn KvTx, v: &Value) -> Result<u64> {
        Ok(self.resolve_quad_values(tx, std::slice::from_ref(v))?[0])
    }

    fn resolve_quad_values(&self, tx: &dyn KvTx, vals: &[Value]) -> Result<Vec<u64>> {
        let mut out = vec![0u64; vals.len()];
        let mut inds = Vec::with_capacity(vals.len());
        let mut keys = Vec::with_capacity(vals.len());
        for (i, v) in vals.iter().enumerate() {
            if let Value::Iri(iri) = v {
                if let Some(id) = self.value_lru.get(iri) {
                    out[i] = id;
                    continue;
                }
            }
            inds.push(i);
            keys.push(indexing::bucket_key_for_hash(&v.hash()));
        }
        if keys.is_empty() {
            return Ok(out);
        }
        let resp = tx.get_batch(&keys)?;
        for (j, b) in resp.iter().enumerate() {
            let Some(b) = b else { continue };
            if b.is_empty() {
                continue;
            }
            let i = inds[j];
            out[i] = indexing::uvarint(b)?.0;
            if out[i] != 0 {
                if let Value::Iri(iri) = &vals[i] {
                    self.value_lru.put(iri.clone(), out[i]);
                }
            }
        }
        Ok(out)
    }

    fn get_val_from_log(&self, tx: &dyn KvTx, id: u64) -> Result<Option<Value>> {
        if id == 0 {
            return Ok(None);
        }
        match self.get_primitive_from_log(tx, id)? {
            Some(p) if p.is_node() => Ok(Some(p.decode_value()?)),
            _ => Ok(None),
        }
    }

    /// The index whose key prefix starts with `d`, if any.
    fn leading_index(&self, d: Direction) -> Option<QuadIndex> {
        let inds = self.best_indexes(&[d]);
        inds.into_iter().find(|ind| ind.dirs.first() == Some(&d))
    }

    fn collect_quads_by_direction(&self, d: Direction, id: u64) -> Result<Vec<Ref>> {
        if id == 0 {
            return Ok(Vec::new());
        }
        kv::view(self.db.as_ref(), |tx| {
            let mut ids: Vec<u64> = Vec::new();
            match self.leading_index(d) {
                Some(ind) => {
                    let prefix = kv::bucket_key(&ind.bucket(), &id.to_be_bytes());
                    for pair in tx.scan(&prefix)? {
                        let (_, v) = pair?;
                        if v.is_empty() {
                            continue;
                        }
                        ids.extend(indexing::decode_index(&v)?);
                    }
                }
                None => {
                    // no index leads with this direction; walk the log
                    let prefix = kv::bucket_prefix(LOG_BUCKET);
                    for pair in tx.scan(&prefix)? {
                        let (k, v) = pair?;
                        if k.len() == prefix.len() || v.is_empty() {
                            continue;
                        }
                        let p = Primitive::decode(&v)?;
                        if p.is_node() || p.deleted || p.get_direction(d) != id {
                            continue;
                        }
                        ids.push(p.id);
                    }
                    let refs = self.fetch_quad_refs(tx, &ids, d, id)?;
                    return Ok(refs);
                }
            }
            self.fetch_quad_refs(tx, &ids, d, id)
        })
    }

    fn fetch_quad_refs(
        &self,
        tx: &dyn KvTx,
        ids: &[u64],
        d: Direction,
        want: u64,
    ) -> Result<Vec<Ref>> {
        let prims = self.get_primitives_from_log(tx, ids)?;
        let mut refs = Vec::with_capacity(prims.len());
        for p in prims.into_iter().flatten() {
            if p.deleted || p.is_node() || p.get_direction(d) != want {
                continue;
            }
            refs.push(Ref::Quad {
                id: p.id,
                dirs: p.quad_ids(),
            });
        }
        Ok(refs)
    }
}

impl QuadStore for KvQuadStore {
    fn value_of(&self, v: &Value) -> Result<Option<Ref>> {
        kv::view(self.db.as_ref(), |tx| {
            let id = self.resolve_quad_value(tx, v)?;
            Ok(if id == 0 { None } else { Some(Ref::Node(id)) })
        })
    }

    fn refs_of(&self, vals: &[Value]) -> Result<Vec<Option<Ref>>> {
        kv::view(self.db.as_ref(), |tx| {
            let ids = self.resolve_quad_values(tx, vals)?;
            Ok(ids
                .into_iter()
                .map(|id| if id == 0 { None } else { Some(Ref::Node(id)) })
                .collect())
        })
    }

    fn name_of(&self, r: &Ref) -> Result<Option<Value>> {
        let id = r.id();
        if id == 0 {
            return Ok(None);
        }
        kv::view(self.db.as_ref(), |tx| self.get_val_from_log(tx, id))
    }

    fn quad(&self, r: &Ref) -> Result<Quad> {
        let Ref::Quad { dirs, .. } = r else {
            return Ok(Quad::default());
        };
        kv::view(self.db.as_ref(), |tx| {
            let mut q = Quad::default();
            for d in Direction::ALL {
                let id = dirs.get(d);
                if id == 0 {
                    continue;
                }
                q.set(d, self.get_val_from_log(tx, id)?);
            }
            Ok(q)
        })
    }

    fn quad_direction(&self, r: &Ref, d: Direction) -> Result<Option<Ref>> {
        let Ref::Quad { dirs, .. } = r else {
            return Ok(None);
        };
        let id = dirs.get(d);
        if id == 0 {
            return Ok(None);
        }
        Ok(Some(Ref::Node(id)))
    }

    fn quad_iterator(&self, d: Direction, r: &Ref) -> Result<QuadRefIter> {
        let refs = self.collect_quads_by_direction(d, r.id())?;
        Ok(QuadRefIter::new(refs))
    }

    fn quad_iterator_size(&self, d: Direction, r: &Ref) -> Result<Size> {
        let id = r.id();
        if id == 0 {
            return Ok(Size {
                value: 0,
                exact: true,
            });
        }
        match self.leading_index(d) {
            Some(ind) => kv::view(self.db.as_ref(), |tx| {
                let prefix = kv::bucket_key(&ind.bucket(), &id.to_be_bytes());
                let mut count = 0i64;
                for pair in tx.scan(&prefix)? {
                    let (_, v) = pair?;
                    if v.is_empty() {
                        continue;
                    }
                    count += indexing::count_index(&v)?;
                }
                // tombstoned quads may still be listed
                Ok(Size {
                    value: count,
                    exact: false,
                })
            }),
            None => Ok(Size {
                value: self.size(),
                exact: false,
            }),
        }
    }

    fn apply_deltas(&mut self, deltas: &[Delta], opts: IgnoreOpts) -> Result<()> {
        let mut state = self.writer.lock();
        let res = self.apply_deltas_locked(&mut state, deltas, opts);
        if res.is_err() {
            // discard buffered index entries and cached ids from the
            // failed transaction
            state.map_bucket.clear();
            self.value_lru.clear();
        } else {
            debug!(deltas = deltas.len(), "applied deltas");
        }
        res
    }

    fn stats(&self, exact: bool) -> Result<Stats> {
        let size = get_size(self.db.as_ref())?;
        let mut nodes = Size {
            value: size / 3, // average in-degree assumption; estimate only
            exact: false,
        };
        if exact {
            nodes.value = kv::view(self.db.as_ref(), |tx| {
                let prefix = kv::bucket_prefix(LOG_BUCKET);
                let mut count = 0i64;
                for pair in tx.scan(&prefix)? {
                    let (k, v) = pair?;
                    if k.len() == prefix.len() || v.is_empty() {
                        continue;
                    }
                    if Primitive::decode(&v)?.is_node() {
                        count += 1;
                    }
                }
                Ok(count)
            })?;
            nodes.exact = true;
        }
        Ok(Stats {
            nodes,
            quads: Size {
                value: size,
                exact: true,
            },
        })
    }

    fn new_quad_writer(&mut self) -> Result<Box<dyn QuadWriter + '_>> {
        Ok(Box::new(KvQuadWriter {
            qs: self,
            state: None,
            tx: None,
            n: 0,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.db.close()
    }
}

/// A streaming writer over the persistent store. Holds the writer lock
/// and an open write transaction from the first write until `close`;
/// flushes indexes and commits every [`DEFAULT_BATCH`]` * 20` quads.
struct KvQuadWriter<'a> {
    qs: &'a KvQuadStore,
    state: Option<MutexGuard<'a, WriterState>>,
    tx: Option<Box<dyn KvTx + 'a>>,
    n: usize,
}

impl KvQuadWriter<'_> {
    fn flush(&mut self) -> Result<()> {
        self.n = 0;
        let state = self.state.as_mut().expect("writer state held");
        let tx = self.tx.as_mut().expect("transaction open");
        self.qs.flush_map_bucket(tx.as_mut(), state)?;
        tx.commit()?;
        self.tx = Some(self.qs.db.tx(true)?);
        Ok(())
    }
}

impl KvQuadWriter<'_> {
    /// Abandons the stream: the open transaction is dropped uncommitted
    /// and buffered index entries are discarded.
    fn abort(&mut self) {
        self.tx = None;
        if let Some(mut state) = self.state.take() {
            state.map_bucket.clear();
        }
        self.qs.value_lru.clear();
    }
}

impl QuadWriter for KvQuadWriter<'_> {
    fn write_quads(&mut self, quads: &[Quad]) -> Result<usize> {
        if self.tx.is_none() {
            self.state = Some(self.qs.writer.lock());
            self.tx = Some(self.qs.db.tx(true)?);
        }
        let res = (|| {
            let state = self.state.as_mut().expect("writer state held");
            let tx = self.tx.as_mut().expect("transaction open");
            let mut deltas = deltas::insert_quads(quads);
            self.qs.apply_add_deltas(
                tx.as_mut(),
                state,
                &[],
                &mut deltas,
                IgnoreOpts {
                    ignore_dup: true,
                    ignore_missing: false,
                },
            )
        })();
        if let Err(e) = res {
            self.abort();
            return Err(e);
        }
        self.n += quads.len();
        if self.n >= DEFAULT_BATCH * 20 {
            if let Err(e) = self.flush() {
                self.abort();
                return Err(e);
            }
        }
        Ok(quads.len())
    }

    fn close(&mut self) -> Result<()> {
        let (Some(mut tx), Some(mut state)) = (self.tx.take(), self.state.take()) else {
            return Ok(());
        };
        let res = self
            .qs
            .flush_map_bucket(tx.as_mut(), &mut state)
            .and_then(|_| tx.commit());
        if res.is_err() {
            state.map_bucket.clear();
            self.qs.value_lru.clear();
        }
        res
    }
}
