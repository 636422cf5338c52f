use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;

use super::{Store, StoredBlock};

#[derive(Default)]
struct Inner {
    by_slot: BTreeMap<u64, StoredBlock>,
    slot_by_hash: HashMap<Vec<u8>, u64>,
    slot_by_number: BTreeMap<u64, u64>,
    latest_commit: Option<(u64, u64)>,
}

/// In-memory backend, used in tests and for ephemeral nodes
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_block(&self, block: &StoredBlock) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.slot_by_hash.insert(block.hash.to_vec(), block.slot);
        inner.slot_by_number.insert(block.number, block.slot);
        inner.by_slot.insert(block.slot, block.clone());
        Ok(())
    }

    fn get_block_by_hash(&self, hash: &[u8]) -> Result<Option<StoredBlock>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .slot_by_hash
            .get(hash)
            .and_then(|slot| inner.by_slot.get(slot))
            .cloned())
    }

    fn get_block_by_slot(&self, slot: u64) -> Result<Option<StoredBlock>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.by_slot.get(&slot).cloned())
    }

    fn get_block_by_number(&self, number: u64) -> Result<Option<StoredBlock>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .slot_by_number
            .get(&number)
            .and_then(|slot| inner.by_slot.get(slot))
            .cloned())
    }

    fn get_latest_block(&self) -> Result<Option<StoredBlock>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.by_slot.values().next_back().cloned())
    }

    fn record_commit(&self, slot: u64, timestamp: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.latest_commit = Some((slot, timestamp));
        Ok(())
    }

    fn latest_commit(&self) -> Result<Option<(u64, u64)>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.latest_commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::make_block;
    use dingo_common::Point;

    #[test]
    fn should_index_by_hash_slot_and_number() {
        let store = MemoryStore::new();
        let block = make_block(Point::Origin, 100, 1, "first");
        let stored = StoredBlock::from_block(&block);
        store.insert_block(&stored).unwrap();

        assert_eq!(store.get_block_by_hash(&stored.hash).unwrap(), Some(stored.clone()));
        assert_eq!(store.get_block_by_slot(100).unwrap(), Some(stored.clone()));
        assert_eq!(store.get_block_by_number(1).unwrap(), Some(stored.clone()));
        assert_eq!(store.get_latest_block().unwrap(), Some(stored));
        assert_eq!(store.get_block_by_slot(101).unwrap(), None);
    }

    #[test]
    fn should_track_latest_commit() {
        let store = MemoryStore::new();
        assert_eq!(store.latest_commit().unwrap(), None);
        store.record_commit(100, 1_700_000_000).unwrap();
        store.record_commit(200, 1_700_000_060).unwrap();
        assert_eq!(store.latest_commit().unwrap(), Some((200, 1_700_000_060)));
    }
}
