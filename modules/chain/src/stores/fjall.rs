use std::path::Path;

use anyhow::{Context, Result};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use super::{Store, StoredBlock};

const BLOCKS_PARTITION: &str = "blocks";
const HASHES_BY_SLOT_PARTITION: &str = "block-hashes-by-slot";
const HASHES_BY_NUMBER_PARTITION: &str = "block-hashes-by-number";
const COMMITS_PARTITION: &str = "commits";

const LATEST_COMMIT_KEY: &[u8] = b"latest";

/// Keyspace-per-index block store over a single fjall database
pub struct FjallStore {
    keyspace: Keyspace,
    blocks: PartitionHandle,
    hashes_by_slot: PartitionHandle,
    hashes_by_number: PartitionHandle,
    commits: PartitionHandle,
}

impl FjallStore {
    pub fn open(path: &Path) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let blocks = keyspace.open_partition(BLOCKS_PARTITION, PartitionCreateOptions::default())?;
        let hashes_by_slot =
            keyspace.open_partition(HASHES_BY_SLOT_PARTITION, PartitionCreateOptions::default())?;
        let hashes_by_number = keyspace
            .open_partition(HASHES_BY_NUMBER_PARTITION, PartitionCreateOptions::default())?;
        let commits =
            keyspace.open_partition(COMMITS_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            blocks,
            hashes_by_slot,
            hashes_by_number,
            commits,
        })
    }

    fn get_by_hash(&self, hash: &[u8]) -> Result<Option<StoredBlock>> {
        let Some(raw) = self.blocks.get(hash)? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&raw).context("corrupt stored block")?))
    }
}

impl Store for FjallStore {
    fn insert_block(&self, block: &StoredBlock) -> Result<()> {
        let encoded = minicbor::to_vec(block).context("could not encode block")?;
        let mut batch = self.keyspace.batch();
        batch.insert(&self.blocks, block.hash.as_slice(), encoded);
        batch.insert(
            &self.hashes_by_slot,
            block.slot.to_be_bytes(),
            block.hash.as_slice(),
        );
        batch.insert(
            &self.hashes_by_number,
            block.number.to_be_bytes(),
            block.hash.as_slice(),
        );
        batch.commit()?;
        Ok(())
    }

    fn get_block_by_hash(&self, hash: &[u8]) -> Result<Option<StoredBlock>> {
        self.get_by_hash(hash)
    }

    fn get_block_by_slot(&self, slot: u64) -> Result<Option<StoredBlock>> {
        let Some(hash) = self.hashes_by_slot.get(slot.to_be_bytes())? else {
            return Ok(None);
        };
        self.get_by_hash(&hash)
    }

    fn get_block_by_number(&self, number: u64) -> Result<Option<StoredBlock>> {
        let Some(hash) = self.hashes_by_number.get(number.to_be_bytes())? else {
            return Ok(None);
        };
        self.get_by_hash(&hash)
    }

    fn get_latest_block(&self) -> Result<Option<StoredBlock>> {
        let Some((_, hash)) = self.hashes_by_slot.last_key_value()? else {
            return Ok(None);
        };
        self.get_by_hash(&hash)
    }

    fn record_commit(&self, slot: u64, timestamp: u64) -> Result<()> {
        let mut value = [0u8; 16];
        value[..8].copy_from_slice(&slot.to_be_bytes());
        value[8..].copy_from_slice(&timestamp.to_be_bytes());
        self.commits.insert(LATEST_COMMIT_KEY, value)?;
        Ok(())
    }

    fn latest_commit(&self) -> Result<Option<(u64, u64)>> {
        let Some(raw) = self.commits.get(LATEST_COMMIT_KEY)? else {
            return Ok(None);
        };
        let raw: [u8; 16] = raw.as_ref().try_into().context("corrupt commit record")?;
        let slot = u64::from_be_bytes(raw[..8].try_into().expect("slice is 8 bytes"));
        let timestamp = u64::from_be_bytes(raw[8..].try_into().expect("slice is 8 bytes"));
        Ok(Some((slot, timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::make_block;
    use dingo_common::Point;
    use tempfile::TempDir;

    struct TestState {
        #[allow(unused)]
        dir: TempDir,
        store: FjallStore,
    }

    fn init_state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();
        TestState { dir, store }
    }

    #[test]
    fn should_round_trip_a_block() {
        let state = init_state();
        let block = make_block(Point::Origin, 100, 1, "first");
        let stored = StoredBlock::from_block(&block);
        state.store.insert_block(&stored).unwrap();

        assert_eq!(
            state.store.get_block_by_hash(&stored.hash).unwrap(),
            Some(stored.clone())
        );
        assert_eq!(state.store.get_block_by_slot(100).unwrap(), Some(stored.clone()));
        assert_eq!(state.store.get_block_by_number(1).unwrap(), Some(stored));
    }

    #[test]
    fn should_not_error_when_block_not_found() {
        let state = init_state();
        assert_eq!(state.store.get_block_by_hash(&[0xfa, 0x15, 0x0e]).unwrap(), None);
        assert_eq!(state.store.get_block_by_slot(1).unwrap(), None);
    }

    #[test]
    fn latest_block_follows_the_highest_slot() {
        let state = init_state();
        let first = make_block(Point::Origin, 100, 1, "first");
        let second = make_block(first.point(), 200, 2, "second");
        state.store.insert_block(&StoredBlock::from_block(&first)).unwrap();
        state.store.insert_block(&StoredBlock::from_block(&second)).unwrap();

        let latest = state.store.get_latest_block().unwrap().unwrap();
        assert_eq!(latest.slot, 200);
    }

    #[test]
    fn should_persist_commit_records() {
        let state = init_state();
        state.store.record_commit(100, 1_700_000_000).unwrap();
        assert_eq!(state.store.latest_commit().unwrap(), Some((100, 1_700_000_000)));
    }
}
