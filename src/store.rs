//! Key-value storage capability backing the chain database

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered mutations the store applies all-or-nothing
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Storage operations the database relies on. `write_batch` must be
/// failure-atomic: either every op lands or none does.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Entries whose key starts with `prefix`, in key order, after skipping
    /// `offset` and returning at most `limit`.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        (**self).write_batch(batch)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (**self).scan_prefix(prefix, offset, limit)
    }
}

/// In-memory store for tests and ephemeral nodes
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every key currently stored, as UTF-8 text where possible
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut entries = self.entries.write();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .skip(offset)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put("a", "1");
        batch.put("a", "2");
        batch.put("b", "3");
        batch.delete("b");
        store.write_batch(batch).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_prefix_paginates() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for i in 0..5 {
            batch.put(format!("p:{}", i), vec![i as u8]);
        }
        batch.put("q:0", "x");
        batch.put("o:9", "y");
        store.write_batch(batch).unwrap();

        let all = store.scan_prefix(b"p:", 0, usize::MAX).unwrap();
        assert_eq!(all.len(), 5);
        let page = store.scan_prefix(b"p:", 1, 2).unwrap();
        assert_eq!(page, vec![(b"p:1".to_vec(), vec![1]), (b"p:2".to_vec(), vec![2])]);
    }

    #[test]
    fn test_shared_store_through_arc() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        batch.put("k", "v");
        store.write_batch(batch).unwrap();
        assert_eq!(KeyValueStore::get(&store, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
