use std::sync::Arc;

use dingo_common::{Block, Point};
use tokio::sync::watch;

use crate::chain::{ChainError, ChainStore};

/// A delta a follower must apply to stay on the canonical chain
#[derive(Debug, Clone)]
pub enum ChainUpdate {
    RollForward(Arc<Block>),
    Rollback(Point),
}

/// A follower cursor over the chain store.
///
/// `try_next` is the non-blocking form and returns `None` at the tip;
/// `next` suspends until the chain changes. Rollbacks that undercut the
/// cursor are reported in-band before any further forward block.
pub struct ChainIter {
    chain: Arc<ChainStore>,
    cursor: Point,
    cursor_number: u64,
    version: u64,
    changes: watch::Receiver<u64>,
}

impl ChainIter {
    pub(crate) fn new(chain: Arc<ChainStore>, cursor: Point, number: u64, version: u64) -> Self {
        let changes = chain.changes.subscribe();
        Self {
            chain,
            cursor,
            cursor_number: number,
            version,
            changes,
        }
    }

    pub fn cursor(&self) -> Point {
        self.cursor
    }

    /// Advance one step without blocking. `None` means the cursor is at the
    /// chain tip.
    pub fn try_next(&mut self) -> Result<Option<ChainUpdate>, ChainError> {
        if self.chain.is_closed() {
            return Err(ChainError::Cancelled);
        }
        let inner = self.chain.read();

        // A rollback which removed blocks at or below our cursor forces the
        // follower back to the deepest unseen target before anything else.
        let target = inner
            .rollbacks
            .iter()
            .filter(|r| r.version > self.version && r.number < self.cursor_number)
            .min_by_key(|r| r.number);
        if let Some(record) = target {
            self.cursor = record.point;
            self.cursor_number = record.number;
            self.version = inner.version;
            return Ok(Some(ChainUpdate::Rollback(record.point)));
        }
        self.version = inner.version;

        let next_number = self.cursor_number + 1;
        if next_number > inner.tip().block_number {
            return Ok(None);
        }
        if let Some(block) = inner.volatile_by_number(next_number) {
            let block = block.clone();
            if self.cursor_number >= 1 && block.header.parent != self.cursor {
                // The cursor fell off the chain without a surviving rollback
                // record; resynchronize from the immutable anchor.
                let anchor = inner.anchor;
                self.cursor = anchor.point;
                self.cursor_number = anchor.block_number;
                return Ok(Some(ChainUpdate::Rollback(anchor.point)));
            }
            self.cursor = block.point();
            self.cursor_number = next_number;
            return Ok(Some(ChainUpdate::RollForward(block)));
        }
        drop(inner);

        // The follower is still in the immutable prefix
        match self.chain.immutable_by_number(next_number)? {
            Some(block) => {
                let block = Arc::new(block);
                self.cursor = block.point();
                self.cursor_number = next_number;
                Ok(Some(ChainUpdate::RollForward(block)))
            }
            None => Ok(None),
        }
    }

    /// Advance one step, suspending at the tip until the chain changes.
    /// Returns `ChainError::Cancelled` once the chain store is closed.
    pub async fn next(&mut self) -> Result<ChainUpdate, ChainError> {
        loop {
            if let Some(update) = self.try_next()? {
                return Ok(update);
            }
            if self.changes.changed().await.is_err() {
                return Err(ChainError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{extend, make_block, test_chain};
    use std::time::Duration;

    #[test]
    fn iterates_forward_to_the_tip() {
        let chain = test_chain(10);
        let points = extend(&chain, 3, "a");
        let mut iter = chain.iterator(Point::Origin).unwrap();
        for point in &points {
            match iter.try_next().unwrap() {
                Some(ChainUpdate::RollForward(block)) => assert_eq!(block.point(), *point),
                other => panic!("expected roll forward, got {other:?}"),
            }
        }
        assert!(iter.try_next().unwrap().is_none());
    }

    #[test]
    fn starts_from_a_mid_chain_point() {
        let chain = test_chain(10);
        let points = extend(&chain, 4, "a");
        let mut iter = chain.iterator(points[1]).unwrap();
        match iter.try_next().unwrap() {
            Some(ChainUpdate::RollForward(block)) => assert_eq!(block.point(), points[2]),
            other => panic!("expected roll forward, got {other:?}"),
        }
    }

    #[test]
    fn unknown_start_point_is_rejected() {
        let chain = test_chain(10);
        extend(&chain, 2, "a");
        let missing = Point::specific(1, dingo_common::BlockHash::default());
        assert!(chain.iterator(missing).is_err());
    }

    #[test]
    fn reports_rollback_before_the_new_fork() {
        let chain = test_chain(10);
        let points = extend(&chain, 3, "a");
        let mut iter = chain.iterator(Point::Origin).unwrap();
        while let Some(ChainUpdate::RollForward(_)) = iter.try_next().unwrap() {}

        chain.rollback(points[0]).unwrap();
        let fork = make_block(points[0], 999, 2, "fork");
        let fork_point = fork.point();
        chain.append_block(fork).unwrap();

        match iter.try_next().unwrap() {
            Some(ChainUpdate::Rollback(point)) => assert_eq!(point, points[0]),
            other => panic!("expected rollback, got {other:?}"),
        }
        match iter.try_next().unwrap() {
            Some(ChainUpdate::RollForward(block)) => assert_eq!(block.point(), fork_point),
            other => panic!("expected roll forward, got {other:?}"),
        }
    }

    #[test]
    fn rollback_ahead_of_the_cursor_is_invisible() {
        let chain = test_chain(10);
        let points = extend(&chain, 4, "a");
        let mut iter = chain.iterator(Point::Origin).unwrap();
        // Only consume the first block
        assert!(matches!(
            iter.try_next().unwrap(),
            Some(ChainUpdate::RollForward(_))
        ));

        chain.rollback(points[1]).unwrap();
        let fork = make_block(points[1], 999, 3, "fork");
        chain.append_block(fork).unwrap();

        // The follower sees the surviving prefix and then the fork, with no
        // rollback in between
        match iter.try_next().unwrap() {
            Some(ChainUpdate::RollForward(block)) => assert_eq!(block.point(), points[1]),
            other => panic!("expected roll forward, got {other:?}"),
        }
        match iter.try_next().unwrap() {
            Some(ChainUpdate::RollForward(block)) => assert_eq!(block.slot(), 999),
            other => panic!("expected roll forward, got {other:?}"),
        }
        assert!(iter.try_next().unwrap().is_none());
    }

    #[test]
    fn streams_the_immutable_prefix_from_the_store() {
        let chain = test_chain(2);
        let points = extend(&chain, 6, "a");
        let mut iter = chain.iterator(Point::Origin).unwrap();
        for point in &points {
            match iter.try_next().unwrap() {
                Some(ChainUpdate::RollForward(block)) => assert_eq!(block.point(), *point),
                other => panic!("expected roll forward, got {other:?}"),
            }
        }
        assert!(iter.try_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn blocking_next_wakes_on_append() {
        let chain = test_chain(10);
        extend(&chain, 1, "a");
        let mut iter = chain.iterator(Point::Origin).unwrap();
        iter.try_next().unwrap();

        let waiter = tokio::spawn(async move { iter.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let appended = extend(&chain, 1, "b");

        let update = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap()
            .unwrap();
        match update {
            ChainUpdate::RollForward(block) => assert_eq!(block.point(), appended[0]),
            other => panic!("expected roll forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocking_next_unblocks_with_cancelled_on_close() {
        let chain = test_chain(10);
        extend(&chain, 1, "a");
        let mut iter = chain.iterator(Point::Origin).unwrap();
        iter.try_next().unwrap();

        let waiter = tokio::spawn(async move { iter.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        chain.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert!(matches!(result, Err(ChainError::Cancelled)));
    }
}
