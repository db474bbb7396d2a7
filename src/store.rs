//! Durable pre-image collection: insert-only, keyed, ordered.
//!
//! One logical store per deployment, scoped internally by collection
//! identity. Iteration order is key order, which by construction equals the
//! commit order of the triggering writes.

use crate::record::{CollectionId, PreImageKey, PreImageRecord};
use log::warn;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::RangeBounds;
use thiserror::Error;

/// Outcome of a store insert. A re-presented key is a benign conflict, not
/// an error: crash replay re-derives the same record from the same log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateKey,
}

#[derive(Debug, Default)]
pub struct PreImageStore {
    records: BTreeMap<PreImageKey, PreImageRecord>,
}

impl PreImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one record. Idempotent per key: the second presentation of a
    /// key observes the existing record and changes nothing.
    pub fn insert(&mut self, record: PreImageRecord) -> InsertOutcome {
        if let Some(existing) = self.records.get(&record.key) {
            if *existing != record {
                // Both attempts derive from the same log entry, so content
                // divergence indicates a corrupt replay upstream.
                warn!(
                    "event=preimage_duplicate_content_mismatch ts={} batch_index={} collection={}",
                    record.key.ts.0, record.key.batch_index, record.collection.0
                );
            }
            return InsertOutcome::DuplicateKey;
        }
        self.records.insert(record.key, record);
        InsertOutcome::Inserted
    }

    pub fn get(&self, key: &PreImageKey) -> Option<&PreImageRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_key(&self) -> Option<PreImageKey> {
        self.records.keys().next_back().copied()
    }

    /// Records for one collection within a key range, ascending by key.
    /// Consumed by the change-stream read path.
    pub fn query<R>(&self, collection: CollectionId, range: R) -> Vec<PreImageRecord>
    where
        R: RangeBounds<PreImageKey>,
    {
        self.records
            .range(range)
            .filter(|(_, record)| record.collection == collection)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// All records in key order, across collections.
    pub fn scan(&self) -> impl Iterator<Item = &PreImageRecord> {
        self.records.values()
    }

    /// SHA-256 over the ordered record stream. Two nodes that have replayed
    /// the same log prefix must produce the same digest.
    pub fn digest(&self) -> Result<[u8; 32], StoreError> {
        let mut hasher = Sha256::new();
        for record in self.records.values() {
            let bytes = serde_json::to_vec(record)?;
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        Ok(hasher.finalize().into())
    }

    /// Removes every record belonging to a dropped collection.
    pub fn drop_collection(&mut self, collection: CollectionId) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.collection != collection);
        before - self.records.len()
    }

    /// Truncation hook for the external retention policy: removes records
    /// whose operation time is strictly older than the cutoff.
    pub fn expire_before(&mut self, cutoff_wall_time_ms: u64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.op_wall_time_ms >= cutoff_wall_time_ms);
        before - self.records.len()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DocumentId, LogTimestamp};
    use serde_json::json;

    fn record(ts: u64, batch_index: u32, collection: u64) -> PreImageRecord {
        PreImageRecord {
            key: PreImageKey::new(LogTimestamp(ts), batch_index),
            collection: CollectionId(collection),
            document_id: DocumentId::new(format!("doc-{ts}")),
            payload: json!({"_id": format!("doc-{ts}"), "v": ts}),
            op_wall_time_ms: 1_000 + ts,
        }
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let mut store = PreImageStore::new();
        assert_eq!(store.insert(record(1, 0, 7)), InsertOutcome::Inserted);
        assert_eq!(store.insert(record(1, 0, 7)), InsertOutcome::DuplicateKey);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn query_filters_by_collection_and_orders_by_key() {
        let mut store = PreImageStore::new();
        store.insert(record(3, 0, 7));
        store.insert(record(1, 0, 7));
        store.insert(record(2, 0, 9));
        let results = store.query(CollectionId(7), ..);
        assert_eq!(results.len(), 2);
        assert!(results[0].key < results[1].key);
        assert_eq!(results[0].key.ts, LogTimestamp(1));
    }

    #[test]
    fn digest_is_insertion_order_independent() {
        let mut forward = PreImageStore::new();
        forward.insert(record(1, 0, 7));
        forward.insert(record(2, 0, 7));
        let mut reverse = PreImageStore::new();
        reverse.insert(record(2, 0, 7));
        reverse.insert(record(1, 0, 7));
        assert_eq!(forward.digest().unwrap(), reverse.digest().unwrap());
    }

    #[test]
    fn drop_collection_removes_only_that_collection() {
        let mut store = PreImageStore::new();
        store.insert(record(1, 0, 7));
        store.insert(record(2, 0, 9));
        assert_eq!(store.drop_collection(CollectionId(7)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.scan().next().unwrap().collection, CollectionId(9));
    }

    #[test]
    fn expire_before_truncates_by_wall_time() {
        let mut store = PreImageStore::new();
        store.insert(record(1, 0, 7));
        store.insert(record(5, 0, 7));
        assert_eq!(store.expire_before(1_003), 1);
        assert_eq!(store.len(), 1);
    }
}
