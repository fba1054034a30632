//! The ordered key-value contract the persistent quad store is layered on.
//!
//! The engine itself is external; this module defines the seam it must
//! satisfy (transactions, point reads, batched reads, prefix scans) and a
//! small in-process implementation used for tests and embedded use.
//!
//! Absent keys are expressed as `None`; callers that require a key map the
//! miss to a domain error themselves.

mod memory;

pub use memory::MemoryKv;

use crate::error::Result;

/// Separator between a bucket prefix and the key tail. Keeps prefix scans
/// of one bucket from leaking into a bucket whose name extends it.
pub const BUCKET_SEP: u8 = 0x00;

/// Builds a full key from a bucket prefix and a key tail.
pub fn bucket_key(bucket: &[u8], tail: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(bucket.len() + 1 + tail.len());
    key.extend_from_slice(bucket);
    key.push(BUCKET_SEP);
    key.extend_from_slice(tail);
    key
}

/// The scan prefix covering every key of a bucket, sentinel included.
pub fn bucket_prefix(bucket: &[u8]) -> Vec<u8> {
    bucket_key(bucket, &[])
}

/// Writes the bucket's sentinel key so the bucket exists for prefix scans
/// before any real key lands in it.
pub fn create_bucket(tx: &mut dyn KvTx, bucket: &[u8]) -> Result<()> {
    tx.put(&bucket_prefix(bucket), &[])
}

/// A transaction over the ordered keyspace. Read transactions observe a
/// consistent snapshot; dropping a write transaction without `commit`
/// discards it.
pub trait KvTx {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn get_batch(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Iterates all pairs whose key starts with `prefix`, in key order.
    fn scan<'a>(
        &'a self,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn del(&mut self, key: &[u8]) -> Result<()>;

    /// Atomically publishes the transaction's writes. A no-op for read
    /// transactions.
    fn commit(&mut self) -> Result<()>;
}

/// An ordered key-value engine.
pub trait Kv: Send + Sync {
    /// Opens a transaction; `rw` selects a write transaction.
    fn tx(&self, rw: bool) -> Result<Box<dyn KvTx + '_>>;

    fn close(&self) -> Result<()>;
}

impl<T: Kv + ?Sized> Kv for std::sync::Arc<T> {
    fn tx(&self, rw: bool) -> Result<Box<dyn KvTx + '_>> {
        (**self).tx(rw)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Runs `f` inside a read transaction.
pub fn view<T>(kv: &dyn Kv, f: impl FnOnce(&dyn KvTx) -> Result<T>) -> Result<T> {
    let tx = kv.tx(false)?;
    f(tx.as_ref())
}

/// Runs `f` inside a write transaction and commits it; an error discards
/// the transaction.
pub fn update(kv: &dyn Kv, f: impl FnOnce(&mut dyn KvTx) -> Result<()>) -> Result<()> {
    let mut tx = kv.tx(true)?;
    f(tx.as_mut())?;
    tx.commit()
}
