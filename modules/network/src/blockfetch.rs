//! BlockFetch server handler: serve ranges of raw block bodies out of the
//! chain store.

use std::sync::Arc;

use dingo_chain::ChainStore;
use dingo_common::{Block, Point};
use tracing::debug;

pub struct BlockFetchServer {
    chain: Arc<ChainStore>,
}

impl BlockFetchServer {
    pub fn new(chain: Arc<ChainStore>) -> Self {
        Self { chain }
    }

    /// Blocks between two inclusive points; `None` means NoBlocks (either
    /// bound unknown, or the range inverted)
    pub fn resolve_range(&self, from: Point, to: Point) -> Option<Vec<Arc<Block>>> {
        match self.chain.blocks_in_range(from, to) {
            Ok(blocks) => Some(blocks),
            Err(err) => {
                debug!(from = %from, to = %to, "cannot serve range: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_chain::stores::MemoryStore;
    use dingo_common::{BlockHash, BlockHeader, Era};
    use dingo_event_bus::EventBus;
    use pallas::crypto::hash::Hasher;

    fn extend(chain: &ChainStore, count: u64) -> Vec<Point> {
        let mut points = vec![];
        for _ in 0..count {
            let tip = chain.tip();
            let slot = tip.point.slot_or_default() + 100;
            let number = tip.block_number + 1;
            let mut hasher = Hasher::<256>::new();
            hasher.input(&slot.to_le_bytes());
            let block = Block {
                header: BlockHeader {
                    hash: BlockHash::from(*hasher.finalize()),
                    slot,
                    number,
                    parent: tip.point,
                    era: Era::Conway,
                    bytes: vec![],
                },
                body: slot.to_le_bytes().to_vec(),
            };
            points.push(block.point());
            chain.append_block(block).unwrap();
        }
        points
    }

    fn setup() -> (Arc<ChainStore>, BlockFetchServer) {
        let bus = Arc::new(EventBus::new());
        let chain =
            Arc::new(ChainStore::new(Arc::new(MemoryStore::new()), 100, bus).unwrap());
        (chain.clone(), BlockFetchServer::new(chain))
    }

    #[test]
    fn serves_an_inclusive_range() {
        let (chain, server) = setup();
        let points = extend(&chain, 5);
        let blocks = server.resolve_range(points[1], points[3]).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].point(), points[1]);
        assert_eq!(blocks[2].point(), points[3]);
    }

    #[test]
    fn unknown_start_yields_no_blocks() {
        let (chain, server) = setup();
        let points = extend(&chain, 3);
        let unknown = Point::specific(7, BlockHash::default());
        assert!(server.resolve_range(unknown, points[2]).is_none());
        // Inverted ranges are refused as well
        assert!(server.resolve_range(points[2], points[0]).is_none());
    }
}
