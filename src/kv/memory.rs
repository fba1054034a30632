use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Kv, KvTx};
use crate::error::Result;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// An in-process ordered key-value engine.
///
/// Read transactions clone the `Arc` snapshot and never observe later
/// writes; write transactions buffer their operations and publish them
/// copy-on-write at commit. Writers are expected to be serialized by the
/// layer above (the store's writer lock).
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<Arc<Map>>,
}

impl MemoryKv {
    pub fn new() -> MemoryKv {
        MemoryKv::default()
    }

    /// Number of live keys, for tests and introspection.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Kv for MemoryKv {
    fn tx(&self, rw: bool) -> Result<Box<dyn KvTx + '_>> {
        let snapshot = Arc::clone(&self.map.lock());
        Ok(Box::new(MemoryTx {
            db: self,
            snapshot,
            pending: if rw { Some(BTreeMap::new()) } else { None },
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryTx<'a> {
    db: &'a MemoryKv,
    snapshot: Arc<Map>,
    /// Buffered writes; `None` value marks a deletion. Absent for read
    /// transactions.
    pending: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl KvTx for MemoryTx<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = &self.pending {
            if let Some(v) = pending.get(key) {
                return Ok(v.clone());
            }
        }
        Ok(self.snapshot.get(key).cloned())
    }

    fn scan<'b>(
        &'b self,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'b>> {
        let range = (
            Bound::Included(prefix.to_vec()),
            prefix_end(prefix).map_or(Bound::Unbounded, Bound::Excluded),
        );
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .snapshot
            .range::<Vec<u8>, _>(range.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(pending) = &self.pending {
            for (k, v) in pending.range::<Vec<u8>, _>(range) {
                match v {
                    Some(v) => {
                        merged.insert(k.clone(), v.clone());
                    }
                    None => {
                        merged.remove(k);
                    }
                }
            }
        }
        Ok(Box::new(merged.into_iter().map(Ok)))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(pending) = &mut self.pending {
            pending.insert(key.to_vec(), Some(value.to_vec()));
        }
        Ok(())
    }

    fn del(&mut self, key: &[u8]) -> Result<()> {
        if let Some(pending) = &mut self.pending {
            pending.insert(key.to_vec(), None);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        // Re-arm the transaction so a streaming writer can keep using it
        // after a mid-stream commit.
        self.pending = Some(BTreeMap::new());
        if pending.is_empty() {
            return Ok(());
        }
        let mut guard = self.db.map.lock();
        let map = Arc::make_mut(&mut guard);
        for (k, v) in pending {
            match v {
                Some(v) => {
                    map.insert(k, v);
                }
                None => {
                    map.remove(&k);
                }
            }
        }
        self.snapshot = Arc::clone(&guard);
        Ok(())
    }
}

/// The smallest key strictly greater than every key with the given prefix,
/// or `None` when the prefix is all 0xFF.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}
