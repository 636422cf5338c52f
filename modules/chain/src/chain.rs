use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use dingo_common::messages::{topics, ChainUpdateEvent, Event};
use dingo_common::{Block, BlockHash, Point, Tip};
use dingo_event_bus::EventBus;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::iterator::ChainIter;
use crate::stores::{Store, StoredBlock};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("parent mismatch: block claims {claimed}, tip is {tip}")]
    ParentMismatch { claimed: Point, tip: Point },
    #[error("non-monotonic slot {slot}, tip is at slot {tip_slot}")]
    NonMonotonicSlot { slot: u64, tip_slot: u64 },
    #[error("block {0} already exists")]
    AlreadyExists(BlockHash),
    #[error("point {0} not found in chain")]
    NotFound(Point),
    #[error("point {0} is in the immutable prefix")]
    NotInVolatile(Point),
    #[error("chain store has shut down")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub(crate) struct RollbackRecord {
    pub version: u64,
    pub point: Point,
    pub number: u64,
}

pub(crate) struct ChainInner {
    /// Point and block number of the newest immutable block
    pub anchor: Tip,
    /// The rollback-able suffix, oldest first
    pub volatile: VecDeque<Arc<Block>>,
    /// Hash uniqueness index over the volatile suffix, hash to slot
    by_hash: HashMap<BlockHash, u64>,
    /// Monotonic change counter, bumped on every append or rollback
    pub version: u64,
    /// Recent rollbacks, consulted by iterators to reposition cursors
    pub rollbacks: VecDeque<RollbackRecord>,
}

// Rollbacks older than this many chain changes are forgotten; an iterator
// lagging further behind than the volatile window has lost its position
// anyway.
const MAX_ROLLBACK_RECORDS: usize = 64;

impl ChainInner {
    pub fn tip(&self) -> Tip {
        match self.volatile.back() {
            Some(block) => Tip::new(block.point(), block.number()),
            None => self.anchor,
        }
    }

    /// Locate a volatile block by block number
    pub fn volatile_by_number(&self, number: u64) -> Option<&Arc<Block>> {
        if number <= self.anchor.block_number && self.anchor.point != Point::Origin {
            return None;
        }
        let first = self.volatile.front()?.number();
        let index = number.checked_sub(first)?;
        self.volatile.get(index as usize)
    }

    fn contains(&self, point: &Point) -> bool {
        match point {
            Point::Origin => true,
            Point::Specific { slot, hash } => self.by_hash.get(hash) == Some(slot),
        }
    }
}

/// The canonical chain: an in-memory volatile suffix over a persistent
/// immutable prefix, guarded by a readers-writer lock.
pub struct ChainStore {
    pub(crate) inner: RwLock<ChainInner>,
    store: Arc<dyn Store>,
    security_param: u64,
    pub(crate) changes: watch::Sender<u64>,
    bus: Arc<EventBus<Event>>,
    closed: AtomicBool,
}

impl ChainStore {
    pub fn new(
        store: Arc<dyn Store>,
        security_param: u64,
        bus: Arc<EventBus<Event>>,
    ) -> Result<Self, ChainError> {
        // The persistent store only ever holds immutable blocks, so its
        // latest block is our anchor after a restart.
        let anchor = match store.get_latest_block()? {
            Some(stored) => Tip::new(Point::specific(stored.slot, stored.hash()?), stored.number),
            None => Tip::ORIGIN,
        };
        if anchor.point != Point::Origin {
            info!(anchor = %anchor.point, "recovered immutable chain anchor");
        }
        let (changes, _) = watch::channel(0);
        Ok(Self {
            inner: RwLock::new(ChainInner {
                anchor,
                volatile: VecDeque::new(),
                by_hash: HashMap::new(),
                version: 0,
                rollbacks: VecDeque::new(),
            }),
            store,
            security_param,
            changes,
            bus,
            closed: AtomicBool::new(false),
        })
    }

    /// Shut the store down, unblocking every iterator waiter with a
    /// cancelled result
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let version = {
            let mut inner = self.inner.write().expect("chain lock poisoned");
            inner.version += 1;
            inner.version
        };
        let _ = self.changes.send(version);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ChainInner> {
        self.inner.read().expect("chain lock poisoned")
    }

    pub fn tip(&self) -> Tip {
        self.read().tip()
    }

    pub fn security_param(&self) -> u64 {
        self.security_param
    }

    /// Append a block extending the current tip. Blocks that sink deeper
    /// than `k` below the new tip are flushed to the persistent store and
    /// become immutable.
    pub fn append_block(&self, block: Block) -> Result<(), ChainError> {
        let mut inner = self.inner.write().expect("chain lock poisoned");
        let tip = inner.tip();
        if block.header.parent != tip.point {
            return Err(ChainError::ParentMismatch {
                claimed: block.header.parent,
                tip: tip.point,
            });
        }
        if let Some(tip_slot) = tip.point.slot() {
            if block.slot() <= tip_slot {
                return Err(ChainError::NonMonotonicSlot {
                    slot: block.slot(),
                    tip_slot,
                });
            }
        }
        if inner.by_hash.contains_key(&block.hash()) {
            return Err(ChainError::AlreadyExists(block.hash()));
        }

        let point = block.point();
        let tip = Tip::new(point, block.number());
        inner.by_hash.insert(block.hash(), block.slot());
        inner.volatile.push_back(Arc::new(block));

        // Flush everything beyond the volatile window
        while inner.volatile.len() as u64 > self.security_param {
            let immutable = inner.volatile.pop_front().expect("volatile not empty");
            inner.by_hash.remove(&immutable.hash());
            inner.anchor = Tip::new(immutable.point(), immutable.number());
            self.store.insert_block(&StoredBlock::from_block(&immutable))?;
            let timestamp =
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            self.store.record_commit(immutable.slot(), timestamp)?;
        }

        inner.version += 1;
        let version = inner.version;
        drop(inner);

        debug!(point = %point, "chain extended");
        let _ = self.changes.send(version);
        self.bus.publish(
            topics::CHAIN_UPDATE,
            Arc::new(Event::ChainUpdate(ChainUpdateEvent::BlockApplied {
                point,
                tip,
            })),
        );
        Ok(())
    }

    /// Remove all blocks strictly after `point`
    pub fn rollback(&self, point: Point) -> Result<(), ChainError> {
        let mut inner = self.inner.write().expect("chain lock poisoned");

        let target_number = if point == inner.anchor.point {
            inner.anchor.block_number
        } else {
            match point {
                Point::Origin => {
                    // Origin is only reachable while nothing is immutable
                    if inner.anchor.point != Point::Origin {
                        return Err(ChainError::NotInVolatile(point));
                    }
                    0
                }
                Point::Specific { slot, hash } => {
                    if inner.by_hash.get(&hash) != Some(&slot) {
                        // Distinguish an unknown point from an immutable one
                        if let Some(stored) = self.store.get_block_by_slot(slot)? {
                            if stored.hash()? == hash {
                                return Err(ChainError::NotInVolatile(point));
                            }
                        }
                        return Err(ChainError::NotFound(point));
                    }
                    let block = inner
                        .volatile
                        .iter()
                        .find(|b| b.hash() == hash)
                        .expect("indexed block present");
                    block.number()
                }
            }
        };

        while inner.tip().block_number > target_number && !inner.volatile.is_empty() {
            let removed = inner.volatile.pop_back().expect("volatile not empty");
            inner.by_hash.remove(&removed.hash());
        }

        inner.version += 1;
        let version = inner.version;
        inner.rollbacks.push_back(RollbackRecord {
            version,
            point,
            number: target_number,
        });
        while inner.rollbacks.len() > MAX_ROLLBACK_RECORDS {
            inner.rollbacks.pop_front();
        }
        let tip = inner.tip();
        drop(inner);

        info!(point = %point, "chain rolled back");
        let _ = self.changes.send(version);
        self.bus.publish(
            topics::CHAIN_UPDATE,
            Arc::new(Event::ChainUpdate(ChainUpdateEvent::RolledBack {
                point,
                tip,
            })),
        );
        Ok(())
    }

    /// First candidate present in the current chain. Candidates are
    /// expected newest-first, so the match closest to tip wins.
    pub fn intersect_point(&self, candidates: &[Point]) -> Option<Point> {
        let inner = self.read();
        for candidate in candidates {
            if inner.contains(candidate) {
                return Some(*candidate);
            }
            if let Point::Specific { slot, hash } = candidate {
                if let Ok(Some(stored)) = self.store.get_block_by_slot(*slot) {
                    if stored.hash().is_ok_and(|h| h == *hash) {
                        return Some(*candidate);
                    }
                }
            }
        }
        None
    }

    /// Points sampled at exponentially spaced depths from the tip
    /// backwards (0, 1, 2, 4, 8, ...), capped at `count`
    pub fn recent_chain_points(&self, count: usize) -> Vec<Point> {
        let inner = self.read();
        let tip = inner.tip();
        if tip.point == Point::Origin {
            return vec![];
        }
        let mut points = Vec::with_capacity(count.min(16));
        let mut offset: u64 = 0;
        while points.len() < count {
            let Some(number) = tip.block_number.checked_sub(offset) else {
                break;
            };
            let point = if let Some(block) = inner.volatile_by_number(number) {
                Some(block.point())
            } else {
                match self.store.get_block_by_number(number) {
                    Ok(Some(stored)) => {
                        stored.hash().ok().map(|hash| Point::specific(stored.slot, hash))
                    }
                    _ => None,
                }
            };
            match point {
                Some(point) => points.push(point),
                None => break,
            }
            offset = if offset == 0 { 1 } else { offset * 2 };
        }
        points
    }

    /// Block number of a point on the current chain, volatile or immutable
    fn locate(&self, inner: &ChainInner, point: &Point) -> Option<u64> {
        match point {
            Point::Origin => Some(0),
            Point::Specific { slot, hash } => {
                if inner.by_hash.get(hash) == Some(slot) {
                    inner.volatile.iter().find(|b| b.hash() == *hash).map(|b| b.number())
                } else {
                    match self.store.get_block_by_slot(*slot) {
                        Ok(Some(stored)) if stored.hash().is_ok_and(|h| h == *hash) => {
                            Some(stored.number)
                        }
                        _ => None,
                    }
                }
            }
        }
    }

    /// Blocks between two inclusive points, oldest first. Fails with
    /// `NotFound` if either bound is not on the chain or the range is
    /// inverted.
    pub fn blocks_in_range(&self, from: Point, to: Point) -> Result<Vec<Arc<Block>>, ChainError> {
        let inner = self.read();
        let Some(from_number) = self.locate(&inner, &from) else {
            return Err(ChainError::NotFound(from));
        };
        let Some(to_number) = self.locate(&inner, &to) else {
            return Err(ChainError::NotFound(to));
        };
        if from_number > to_number {
            return Err(ChainError::NotFound(from));
        }
        let mut blocks = vec![];
        for number in from_number.max(1)..=to_number {
            match inner.volatile_by_number(number) {
                Some(block) => blocks.push(block.clone()),
                None => match self.immutable_by_number(number)? {
                    Some(block) => blocks.push(Arc::new(block)),
                    None => return Err(ChainError::NotFound(from)),
                },
            }
        }
        Ok(blocks)
    }

    /// Open a follower cursor positioned at `start`
    pub fn iterator(self: &Arc<Self>, start: Point) -> Result<ChainIter, ChainError> {
        let inner = self.read();
        let number = match start {
            Point::Origin => 0,
            Point::Specific { slot, hash } => {
                if inner.by_hash.get(&hash) == Some(&slot) {
                    inner
                        .volatile
                        .iter()
                        .find(|b| b.hash() == hash)
                        .expect("indexed block present")
                        .number()
                } else if start == inner.anchor.point {
                    inner.anchor.block_number
                } else {
                    match self.store.get_block_by_slot(slot)? {
                        Some(stored) if stored.hash()? == hash => stored.number,
                        _ => return Err(ChainError::NotFound(start)),
                    }
                }
            }
        };
        let version = inner.version;
        drop(inner);
        Ok(ChainIter::new(self.clone(), start, number, version))
    }

    /// Fetch an immutable block back out of the persistent store
    pub(crate) fn immutable_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        let Some(stored) = self.store.get_block_by_number(number)? else {
            return Ok(None);
        };
        Ok(Some(stored.into_block()?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use dingo_common::{BlockHeader, Era};
    use pallas::crypto::hash::Hasher;

    pub fn make_block(parent: Point, slot: u64, number: u64, desc: &str) -> Block {
        let mut hasher = Hasher::<256>::new();
        hasher.input(&slot.to_le_bytes());
        hasher.input(desc.as_bytes());
        let hash = BlockHash::from(*hasher.finalize());
        Block {
            header: BlockHeader {
                hash,
                slot,
                number,
                parent,
                era: Era::Conway,
                bytes: desc.as_bytes().to_vec(),
            },
            body: desc.as_bytes().to_vec(),
        }
    }

    pub fn test_chain(security_param: u64) -> Arc<ChainStore> {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        Arc::new(ChainStore::new(store, security_param, bus).unwrap())
    }

    /// Extend the chain with `count` blocks and return their points
    pub fn extend(chain: &ChainStore, count: u64, tag: &str) -> Vec<Point> {
        let mut points = vec![];
        for _ in 0..count {
            let tip = chain.tip();
            let slot = tip.point.slot_or_default() + 100;
            let number = match tip.point {
                Point::Origin => 1,
                _ => tip.block_number + 1,
            };
            let block = make_block(tip.point, slot, number, &format!("{tag}-{number}"));
            points.push(block.point());
            chain.append_block(block).unwrap();
        }
        points
    }

    #[test]
    fn append_updates_tip_to_the_new_block() {
        let chain = test_chain(10);
        let block = make_block(Point::Origin, 100, 1, "first");
        let point = block.point();
        chain.append_block(block).unwrap();
        assert_eq!(chain.tip(), Tip::new(point, 1));
    }

    #[test]
    fn append_rejects_parent_mismatch() {
        let chain = test_chain(10);
        extend(&chain, 1, "a");
        let orphan = make_block(Point::specific(5, BlockHash::default()), 200, 2, "orphan");
        assert!(matches!(
            chain.append_block(orphan),
            Err(ChainError::ParentMismatch { .. })
        ));
    }

    #[test]
    fn append_rejects_non_monotonic_slot() {
        let chain = test_chain(10);
        let points = extend(&chain, 1, "a");
        let stale = make_block(points[0], 100, 2, "stale");
        assert!(matches!(
            chain.append_block(stale),
            Err(ChainError::NonMonotonicSlot { slot: 100, tip_slot: 100 })
        ));
    }

    #[test]
    fn append_rejects_duplicate_hash() {
        let chain = test_chain(10);
        let block = make_block(Point::Origin, 100, 1, "first");
        let mut dup = block.clone();
        chain.append_block(block).unwrap();
        // Same hash, but otherwise a plausible extension
        dup.header.parent = chain.tip().point;
        dup.header.slot = 200;
        dup.header.number = 2;
        assert!(matches!(
            chain.append_block(dup),
            Err(ChainError::AlreadyExists(_))
        ));
    }

    #[test]
    fn rollback_truncates_strictly_after_point() {
        let chain = test_chain(10);
        let points = extend(&chain, 3, "a");
        chain.rollback(points[0]).unwrap();
        assert_eq!(chain.tip(), Tip::new(points[0], 1));
        // The removed blocks can be replaced by a different fork
        let replacement = make_block(points[0], 777, 2, "fork");
        chain.append_block(replacement).unwrap();
    }

    #[test]
    fn rollback_to_unknown_point_fails() {
        let chain = test_chain(10);
        extend(&chain, 2, "a");
        let missing = Point::specific(12345, BlockHash::default());
        assert!(matches!(
            chain.rollback(missing),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn rollback_into_immutable_prefix_fails() {
        let chain = test_chain(2);
        let points = extend(&chain, 5, "a");
        // With k=2, the first three blocks are immutable by now
        assert!(matches!(
            chain.rollback(points[0]),
            Err(ChainError::NotInVolatile(_))
        ));
        assert!(matches!(
            chain.rollback(Point::Origin),
            Err(ChainError::NotInVolatile(_))
        ));
    }

    #[test]
    fn slots_stay_strictly_increasing_across_rollback_and_append() {
        let chain = test_chain(10);
        let points = extend(&chain, 4, "a");
        chain.rollback(points[1]).unwrap();
        extend(&chain, 3, "b");
        let inner = chain.read();
        let mut prev_slot = None;
        let mut prev_point = inner.anchor.point;
        for block in &inner.volatile {
            if let Some(prev) = prev_slot {
                assert!(block.slot() > prev);
            }
            assert_eq!(block.header.parent, prev_point);
            prev_slot = Some(block.slot());
            prev_point = block.point();
        }
    }

    #[test]
    fn intersect_prefers_the_first_listed_candidate() {
        let chain = test_chain(10);
        let points = extend(&chain, 5, "a");
        let unknown = Point::specific(9, BlockHash::default());
        let candidates = vec![unknown, points[4], points[1]];
        assert_eq!(chain.intersect_point(&candidates), Some(points[4]));
        assert_eq!(chain.intersect_point(&[unknown]), None);
    }

    #[test]
    fn recent_points_start_at_tip_and_intersect() {
        let chain = test_chain(100);
        let points = extend(&chain, 20, "a");
        let recent = chain.recent_chain_points(100);
        assert_eq!(recent[0], points[19]);
        assert_eq!(recent[1], points[18]);
        assert_eq!(recent[2], points[17]);
        assert_eq!(recent[3], points[15]);
        assert_eq!(recent[4], points[11]);
        assert_eq!(recent[5], points[3]);
        // Invariant: the intersect of our own recent points is our tip
        assert_eq!(chain.intersect_point(&recent), Some(chain.tip().point));
    }

    #[test]
    fn recent_points_cover_the_immutable_prefix() {
        let chain = test_chain(4);
        extend(&chain, 12, "a");
        let recent = chain.recent_chain_points(100);
        // Offsets 0,1,2 are volatile; 4 and 8 reach into the flushed prefix
        assert_eq!(recent.len(), 5);
        assert_eq!(chain.intersect_point(&recent), Some(chain.tip().point));
    }

    #[test]
    fn blocks_in_range_returns_inclusive_bounds() {
        let chain = test_chain(10);
        let points = extend(&chain, 5, "a");
        let blocks = chain.blocks_in_range(points[1], points[3]).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].point(), points[1]);
        assert_eq!(blocks[2].point(), points[3]);
    }

    #[test]
    fn blocks_in_range_rejects_unknown_start() {
        let chain = test_chain(10);
        let points = extend(&chain, 3, "a");
        let missing = Point::specific(1, BlockHash::default());
        assert!(chain.blocks_in_range(missing, points[2]).is_err());
        assert!(chain.blocks_in_range(points[2], points[0]).is_err());
    }
}
