//! ChainSync handler logic, both directions.
//!
//! The server side backs one downstream session per connection: intersect
//! lookup against the chain store, then a strictly serial stream of
//! roll-forward/roll-backward deltas driven by a chain iterator. The
//! client side parses upstream headers and turns them into bus events for
//! the chain-extension pipeline.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dingo_chain::{ChainError, ChainStore, ChainUpdate};
use dingo_common::messages::{topics, ChainsyncEvent, Event};
use dingo_common::{Block, BlockHash, BlockHeader, ConnectionId, Era, Point, Tip};
use dingo_event_bus::EventBus;
use pallas::ledger::traverse::MultiEraHeader;
use pallas::network::miniprotocols::chainsync::HeaderContent;
use tracing::debug;

use crate::chainsync_state::ChainSyncState;

/// What a server session must send next
pub enum NextAction {
    RollForward(Arc<Block>, Tip),
    RollBackward(Point, Tip),
    /// Nothing available; reply AwaitReply and block on [`ChainSyncServer::await_next`]
    Await,
}

/// Handler behind every server-side chainsync session, node-to-node and
/// node-to-client alike
pub struct ChainSyncServer {
    chain: Arc<ChainStore>,
    state: Arc<ChainSyncState>,
}

impl ChainSyncServer {
    pub fn new(chain: Arc<ChainStore>, state: Arc<ChainSyncState>) -> Self {
        Self { chain, state }
    }

    /// Resolve the first candidate on our chain and register the caller's
    /// cursor there. Returns the intersect (if any) and the tip captured
    /// with it.
    pub fn find_intersect(
        &self,
        id: ConnectionId,
        points: &[Point],
    ) -> Result<(Option<Point>, Tip), ChainError> {
        let intersect = self.chain.intersect_point(points);
        let tip = self.chain.tip();
        if let Some(point) = intersect {
            self.state.add_client(id, point, &self.chain)?;
        }
        debug!(connection_id = %id, intersect = ?intersect, "find intersect");
        Ok((intersect, tip))
    }

    /// One RequestNext step. Never blocks; an empty reply means the caller
    /// should send AwaitReply and park on [`Self::await_next`].
    pub async fn request_next(&self, id: ConnectionId) -> Result<NextAction, ChainError> {
        let entry = match self.state.get_client(id) {
            Some(entry) => entry,
            // A client which never sent FindIntersect follows from our tip
            None => self.state.add_client(id, self.chain.tip().point, &self.chain)?,
        };
        let mut client = entry.lock().await;
        if client.needs_initial_rollback {
            client.needs_initial_rollback = false;
            let cursor = client.cursor;
            return Ok(NextAction::RollBackward(cursor, self.chain.tip()));
        }
        match client.iter.try_next()? {
            Some(ChainUpdate::RollForward(block)) => {
                client.cursor = block.point();
                Ok(NextAction::RollForward(block, self.chain.tip()))
            }
            Some(ChainUpdate::Rollback(point)) => {
                client.cursor = point;
                Ok(NextAction::RollBackward(point, self.chain.tip()))
            }
            None => Ok(NextAction::Await),
        }
    }

    /// Park until the chain changes, then produce the pending delta. Used
    /// only after an AwaitReply; cancelled when the chain store closes or
    /// the session is dropped.
    pub async fn await_next(&self, id: ConnectionId) -> Result<NextAction, ChainError> {
        let entry = self.state.get_client(id).ok_or(ChainError::Cancelled)?;
        let mut client = entry.lock().await;
        match client.iter.next().await? {
            ChainUpdate::RollForward(block) => {
                client.cursor = block.point();
                Ok(NextAction::RollForward(block, self.chain.tip()))
            }
            ChainUpdate::Rollback(point) => {
                client.cursor = point;
                Ok(NextAction::RollBackward(point, self.chain.tip()))
            }
        }
    }

    /// Per-connection cleanup when the session closes
    pub fn client_closed(&self, id: ConnectionId) {
        self.state.remove_client(id);
    }
}

/// Decode an upstream roll-forward header. Byron epoch-boundary blocks
/// carry no usable header and are skipped.
pub fn parse_header_content(content: &HeaderContent) -> Result<Option<BlockHeader>> {
    let tag = content.byron_prefix.map(|p| p.0);
    let header = MultiEraHeader::decode(content.variant, tag, &content.cbor)
        .context("unexpected block data: undecodable header")?;
    if header.as_eb().is_some() {
        return Ok(None);
    }
    let era = match Era::try_from(content.variant) {
        Ok(era) => era,
        Err(_) => bail!("unexpected block data: unknown era {}", content.variant),
    };
    let parent = match header.previous_hash() {
        Some(hash) => {
            // The wire header only names the parent by hash; the slot is
            // canonicalized against the local tip during chain extension.
            Point::specific(0, BlockHash::from(*hash))
        }
        None => Point::Origin,
    };
    Ok(Some(BlockHeader {
        hash: BlockHash::from(*header.hash()),
        slot: header.slot(),
        number: header.number(),
        parent,
        era,
        bytes: content.cbor.clone(),
    }))
}

/// Client-side event publication, shared by the outbound session worker
pub struct ChainSyncClient {
    bus: Arc<EventBus<Event>>,
    connection_id: ConnectionId,
}

impl ChainSyncClient {
    pub fn new(bus: Arc<EventBus<Event>>, connection_id: ConnectionId) -> Self {
        Self { bus, connection_id }
    }

    pub fn roll_forward(&self, header: BlockHeader, tip: Tip) {
        self.bus.publish(
            topics::CHAINSYNC,
            Arc::new(Event::Chainsync(ChainsyncEvent::RollForward {
                connection_id: self.connection_id,
                header,
                tip,
            })),
        );
    }

    pub fn roll_backward(&self, point: Point, tip: Tip) {
        self.bus.publish(
            topics::CHAINSYNC,
            Arc::new(Event::Chainsync(ChainsyncEvent::RollBackward {
                connection_id: self.connection_id,
                point,
                tip,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_chain::stores::MemoryStore;
    use dingo_common::BlockHash;
    use pallas::crypto::hash::Hasher;

    fn make_block(parent: Point, slot: u64, number: u64, desc: &str) -> Block {
        let mut hasher = Hasher::<256>::new();
        hasher.input(&slot.to_le_bytes());
        hasher.input(desc.as_bytes());
        Block {
            header: BlockHeader {
                hash: BlockHash::from(*hasher.finalize()),
                slot,
                number,
                parent,
                era: Era::Conway,
                bytes: desc.as_bytes().to_vec(),
            },
            body: desc.as_bytes().to_vec(),
        }
    }

    fn extend(chain: &ChainStore, count: u64, tag: &str) -> Vec<Point> {
        let mut points = vec![];
        for _ in 0..count {
            let tip = chain.tip();
            let slot = tip.point.slot_or_default() + 100;
            let number = tip.block_number + 1;
            let block = make_block(tip.point, slot, number, &format!("{tag}-{number}"));
            points.push(block.point());
            chain.append_block(block).unwrap();
        }
        points
    }

    fn server() -> (Arc<ChainStore>, ChainSyncServer) {
        let bus = Arc::new(EventBus::new());
        let chain = Arc::new(ChainStore::new(Arc::new(MemoryStore::new()), 100, bus).unwrap());
        let state = Arc::new(ChainSyncState::new());
        let handler = ChainSyncServer::new(chain.clone(), state);
        (chain, handler)
    }

    #[tokio::test]
    async fn intersect_found_registers_a_cursor_with_initial_rollback() {
        let (chain, handler) = server();
        let points = extend(&chain, 3, "a");
        let id = ConnectionId(0);

        let (intersect, tip) = handler.find_intersect(id, &[points[1]]).unwrap();
        assert_eq!(intersect, Some(points[1]));
        assert_eq!(tip, chain.tip());

        // First RequestNext replays the intersect as a rollback
        match handler.request_next(id).await.unwrap() {
            NextAction::RollBackward(point, reply_tip) => {
                assert_eq!(point, points[1]);
                assert_eq!(reply_tip, chain.tip());
            }
            _ => panic!("expected initial rollback"),
        }
        // Then the stream continues forward
        match handler.request_next(id).await.unwrap() {
            NextAction::RollForward(block, _) => assert_eq!(block.point(), points[2]),
            _ => panic!("expected roll forward"),
        }
        match handler.request_next(id).await.unwrap() {
            NextAction::Await => {}
            _ => panic!("expected await at tip"),
        }
    }

    #[tokio::test]
    async fn intersect_not_found_still_reports_the_tip() {
        let (chain, handler) = server();
        extend(&chain, 2, "a");
        let unknown = Point::specific(5, BlockHash::default());
        let (intersect, tip) = handler.find_intersect(ConnectionId(0), &[unknown]).unwrap();
        assert_eq!(intersect, None);
        assert_eq!(tip, chain.tip());
    }

    #[tokio::test]
    async fn request_next_without_intersect_follows_from_the_tip() {
        let (chain, handler) = server();
        extend(&chain, 2, "a");
        let id = ConnectionId(7);
        match handler.request_next(id).await.unwrap() {
            NextAction::RollBackward(point, _) => assert_eq!(point, chain.tip().point),
            _ => panic!("expected initial rollback at tip"),
        }
        match handler.request_next(id).await.unwrap() {
            NextAction::Await => {}
            _ => panic!("expected await"),
        }
    }

    #[tokio::test]
    async fn sessions_see_a_rollback_on_their_next_request() {
        let (chain, handler) = server();
        let points = extend(&chain, 3, "a");
        let id = ConnectionId(0);
        handler.find_intersect(id, &[points[2]]).unwrap();
        // Consume the initial rollback
        handler.request_next(id).await.unwrap();

        chain.rollback(points[0]).unwrap();
        match handler.request_next(id).await.unwrap() {
            NextAction::RollBackward(point, tip) => {
                assert_eq!(point, points[0]);
                assert_eq!(tip, Tip::new(points[0], 1));
            }
            _ => panic!("expected rollback"),
        }
    }

    #[tokio::test]
    async fn await_next_resumes_when_the_chain_grows() {
        let (chain, handler) = server();
        let points = extend(&chain, 1, "a");
        let id = ConnectionId(0);
        handler.find_intersect(id, &[points[0]]).unwrap();
        handler.request_next(id).await.unwrap();
        assert!(matches!(
            handler.request_next(id).await.unwrap(),
            NextAction::Await
        ));

        let chain_clone = chain.clone();
        let appender = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            extend(&chain_clone, 1, "b");
        });
        match handler.await_next(id).await.unwrap() {
            NextAction::RollForward(block, _) => assert_eq!(block.number(), 2),
            _ => panic!("expected roll forward"),
        }
        appender.await.unwrap();
    }

    #[tokio::test]
    async fn closing_a_session_releases_its_cursor() {
        let (chain, handler) = server();
        let points = extend(&chain, 1, "a");
        let id = ConnectionId(0);
        handler.find_intersect(id, &[points[0]]).unwrap();
        handler.client_closed(id);
        assert!(matches!(
            handler.await_next(id).await,
            Err(ChainError::Cancelled)
        ));
    }
}
