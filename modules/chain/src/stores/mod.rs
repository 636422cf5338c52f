//! Persistent block storage behind a narrow repository interface.
//!
//! Backends are enumerated by an explicit [`StoreBuilder`] at startup
//! rather than registered through global state.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use dingo_common::{Block, BlockHash, BlockHeader, Era, Point};
use minicbor::bytes::ByteVec;

mod fjall;
mod memory;

pub use fjall::FjallStore;
pub use memory::MemoryStore;

/// Narrow repository interface over the immutable block log
pub trait Store: Send + Sync {
    fn insert_block(&self, block: &StoredBlock) -> Result<()>;

    fn get_block_by_hash(&self, hash: &[u8]) -> Result<Option<StoredBlock>>;
    fn get_block_by_slot(&self, slot: u64) -> Result<Option<StoredBlock>>;
    fn get_block_by_number(&self, number: u64) -> Result<Option<StoredBlock>>;
    fn get_latest_block(&self) -> Result<Option<StoredBlock>>;

    /// Record that the chain has been flushed through `slot`
    fn record_commit(&self, slot: u64, timestamp: u64) -> Result<()>;
    fn latest_commit(&self) -> Result<Option<(u64, u64)>>;
}

/// Serialized form of a block in the immutable prefix
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StoredBlock {
    #[n(0)]
    pub slot: u64,
    #[n(1)]
    pub number: u64,
    #[n(2)]
    pub era: u8,
    #[n(3)]
    pub hash: ByteVec,
    #[n(4)]
    pub parent_slot: Option<u64>,
    #[n(5)]
    pub parent_hash: Option<ByteVec>,
    #[n(6)]
    pub header: ByteVec,
    #[n(7)]
    pub body: ByteVec,
}

impl StoredBlock {
    pub fn from_block(block: &Block) -> Self {
        let (parent_slot, parent_hash) = match block.header.parent {
            Point::Origin => (None, None),
            Point::Specific { slot, hash } => (Some(slot), Some(ByteVec::from(hash.to_vec()))),
        };
        Self {
            slot: block.slot(),
            number: block.number(),
            era: block.era().into(),
            hash: ByteVec::from(block.hash().to_vec()),
            parent_slot,
            parent_hash,
            header: ByteVec::from(block.header.bytes.clone()),
            body: ByteVec::from(block.body.clone()),
        }
    }

    pub fn hash(&self) -> Result<BlockHash> {
        BlockHash::try_from(self.hash.as_slice()).context("stored block hash has a bad length")
    }

    pub fn into_block(self) -> Result<Block> {
        let hash = self.hash()?;
        let parent = match (self.parent_slot, &self.parent_hash) {
            (Some(slot), Some(parent_hash)) => Point::specific(
                slot,
                BlockHash::try_from(parent_hash.as_slice())
                    .context("stored parent hash has a bad length")?,
            ),
            _ => Point::Origin,
        };
        let era = Era::try_from(self.era)?;
        Ok(Block {
            header: BlockHeader {
                hash,
                slot: self.slot,
                number: self.number,
                parent,
                era,
                bytes: self.header.into(),
            },
            body: self.body.into(),
        })
    }
}

/// Explicit enumeration of the supported storage backends
pub struct StoreBuilder {
    backend: String,
    path: Option<PathBuf>,
}

impl StoreBuilder {
    pub const KNOWN_BACKENDS: [&'static str; 2] = ["memory", "fjall"];

    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            path: None,
        }
    }

    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn build(self) -> Result<Arc<dyn Store>> {
        match self.backend.as_str() {
            "memory" => Ok(Arc::new(MemoryStore::new())),
            "fjall" => {
                let path = self.path.context("fjall store requires a data path")?;
                Ok(Arc::new(FjallStore::open(&path)?))
            }
            other => bail!(
                "unknown store backend {other}, expected one of {:?}",
                Self::KNOWN_BACKENDS
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_rejected() {
        let err = StoreBuilder::new("sqlite").build().unwrap_err();
        assert!(err.to_string().contains("unknown store backend"));
    }

    #[test]
    fn stored_block_round_trips() {
        let block = crate::chain::tests::make_block(Point::Origin, 100, 1, "first");
        let stored = StoredBlock::from_block(&block);
        let bytes = minicbor::to_vec(&stored).unwrap();
        let decoded: StoredBlock = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, stored);
        assert_eq!(decoded.into_block().unwrap(), block);
    }
}
