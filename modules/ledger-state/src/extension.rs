//! The chain-extension pipeline.
//!
//! A dedicated consumer of the chainsync topic: headers announced by the
//! upstream chainsync client are turned into body-fetch requests, fetched
//! bodies are checked against their headers and appended to the chain
//! store, and the rolling nonce advances with every accepted block.
//! Consistency errors on peer-supplied data drop that peer; the node
//! itself keeps running.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dingo_chain::{ChainError, ChainStore};
use dingo_common::genesis::CardanoNodeConfig;
use dingo_common::messages::{
    topics, BlockFetchedEvent, ChainsyncEvent, Event, FetchRequest,
};
use dingo_common::{Block, BlockHash, BlockHeader, ConnectionId, Era, Point};
use dingo_connection_manager::ConnectionManager;
use dingo_event_bus::EventBus;
use dingo_mempool::Mempool;
use pallas::ledger::traverse::MultiEraBlock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::eras::era_desc;
use crate::pparams::ProtocolParameters;

pub struct ChainExtension {
    chain: Arc<ChainStore>,
    bus: Arc<EventBus<Event>>,
    mempool: Arc<Mempool>,
    connections: Arc<ConnectionManager>,
    config: Arc<CardanoNodeConfig>,
    fetcher: mpsc::Sender<FetchRequest>,
    /// Headers announced but whose bodies have not arrived yet
    pending: HashMap<(u64, BlockHash), BlockHeader>,
    /// Current rolling nonce; empty until the first Shelley-family block
    eta_v: Vec<u8>,
    /// Current era and its protocol parameters
    era: Era,
    pparams: Option<ProtocolParameters>,
}

impl ChainExtension {
    pub fn new(
        chain: Arc<ChainStore>,
        bus: Arc<EventBus<Event>>,
        mempool: Arc<Mempool>,
        connections: Arc<ConnectionManager>,
        config: Arc<CardanoNodeConfig>,
        fetcher: mpsc::Sender<FetchRequest>,
    ) -> Self {
        Self {
            chain,
            bus,
            mempool,
            connections,
            config,
            fetcher,
            pending: HashMap::new(),
            eta_v: vec![],
            era: Era::Byron,
            pparams: None,
        }
    }

    pub fn eta_v(&self) -> &[u8] {
        &self.eta_v
    }

    pub fn protocol_parameters(&self) -> Option<&ProtocolParameters> {
        self.pparams.as_ref()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut chainsync = self.bus.subscribe(topics::CHAINSYNC);
        let mut blockfetch = self.bus.subscribe(topics::BLOCKFETCH);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = chainsync.read() => {
                    let Some(event) = event else { break };
                    if let Event::Chainsync(event) = event.as_ref() {
                        self.handle_chainsync(event).await;
                    }
                }
                event = blockfetch.read() => {
                    let Some(event) = event else { break };
                    if let Event::BlockFetched(event) = event.as_ref() {
                        self.handle_block_fetched(event);
                    }
                }
            }
        }
        info!("chain extension stopped");
        Ok(())
    }

    async fn handle_chainsync(&mut self, event: &ChainsyncEvent) {
        match event {
            ChainsyncEvent::RollForward {
                connection_id,
                header,
                ..
            } => {
                self.pending.insert((header.slot, header.hash), header.clone());
                let request = FetchRequest {
                    connection_id: *connection_id,
                    slot: header.slot,
                    hash: header.hash,
                };
                if self.fetcher.send(request).await.is_err() {
                    warn!("block fetcher has shut down, dropping header");
                }
            }
            ChainsyncEvent::RollBackward {
                connection_id,
                point,
                ..
            } => self.handle_rollback(*connection_id, *point),
        }
    }

    fn handle_rollback(&mut self, connection_id: ConnectionId, point: Point) {
        // A rollback to our current tip is the usual first message after an
        // intersect and changes nothing.
        if point == self.chain.tip().point {
            return;
        }
        match self.chain.rollback(point) {
            Ok(()) => {
                let keep_below = point.slot_or_default();
                self.pending.retain(|(slot, _), _| *slot <= keep_below);
            }
            Err(err @ (ChainError::NotFound(_) | ChainError::NotInVolatile(_))) => {
                self.reject_peer(connection_id, &format!("bad rollback point: {err}"));
            }
            Err(err) => {
                // Local store failure, not peer behavior
                error!("rollback failed: {err}");
            }
        }
    }

    fn handle_block_fetched(&mut self, event: &BlockFetchedEvent) {
        let Some(header) = self.pending.remove(&(event.slot, event.hash)) else {
            debug!(slot = event.slot, "body for a block we no longer want");
            return;
        };
        let mut block = match Self::link_body(&header, &event.body) {
            Ok(block) => block,
            Err(reason) => {
                self.reject_peer(event.connection_id, &reason);
                return;
            }
        };
        // Wire headers only name the parent by hash; canonicalize against
        // the tip so the store's point-equality check sees a full point.
        let tip = self.chain.tip();
        if block.header.parent.hash() == tip.point.hash() {
            block.header.parent = tip.point;
        }
        let era = block.era();
        match self.chain.append_block(block) {
            Ok(()) => {
                self.advance_era(era);
                self.roll_nonce(&header);
                self.drop_consumed_transactions(&event.body);
            }
            Err(ChainError::AlreadyExists(_)) => {
                debug!(slot = event.slot, "block already applied");
            }
            Err(err @ (ChainError::ParentMismatch { .. } | ChainError::NonMonotonicSlot { .. })) => {
                self.reject_peer(event.connection_id, &format!("inconsistent block: {err}"));
            }
            Err(err) => error!("append failed: {err}"),
        }
    }

    /// Confirm that a fetched body belongs to the header that announced it
    fn link_body(header: &BlockHeader, body: &[u8]) -> Result<Block, String> {
        let decoded =
            MultiEraBlock::decode(body).map_err(|e| format!("undecodable block body: {e}"))?;
        let hash = BlockHash::from(*decoded.hash());
        if hash != header.hash {
            return Err(format!(
                "body hash {hash} does not match announced header {}",
                header.hash
            ));
        }
        if decoded.slot() != header.slot {
            return Err(format!(
                "body slot {} does not match announced slot {}",
                decoded.slot(),
                header.slot
            ));
        }
        Ok(Block {
            header: header.clone(),
            body: body.to_vec(),
        })
    }

    fn reject_peer(&self, connection_id: ConnectionId, reason: &str) {
        warn!(connection_id = %connection_id, reason, "dropping misbehaving peer");
        self.connections.remove_connection(connection_id, Some(reason.to_string()));
    }

    /// Walk the hard forks between the current era and `era`
    fn advance_era(&mut self, era: Era) {
        while self.era < era {
            let next = Era::try_from(u8::from(self.era) + 1).expect("era within range");
            let desc = era_desc(next);
            if let Some(hard_fork) = desc.hard_fork {
                match hard_fork(&self.config, self.pparams.as_ref()) {
                    Ok(params) => {
                        info!(era = %next, "hard fork");
                        self.pparams = Some(params);
                    }
                    Err(err) => error!(era = %next, "hard fork failed: {err}"),
                }
            }
            self.era = next;
        }
    }

    fn roll_nonce(&mut self, header: &BlockHeader) {
        let Some(calculate) = era_desc(header.era).calculate_eta_v else {
            return;
        };
        match calculate(&self.config, &self.eta_v, header) {
            Ok(nonce) => self.eta_v = nonce,
            Err(err) => warn!(slot = header.slot, "could not roll nonce: {err}"),
        }
    }

    /// Transactions included in an accepted block leave the mempool
    fn drop_consumed_transactions(&self, body: &[u8]) {
        let Ok(decoded) = MultiEraBlock::decode(body) else {
            return;
        };
        for tx in decoded.txs() {
            self.mempool.remove_transaction(&dingo_common::TxHash::from(*tx.hash()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_chain::stores::MemoryStore;
    use dingo_common::messages::topics;
    use dingo_common::Tip;
    use dingo_mempool::MempoolConfig;
    use pallas::crypto::hash::Hasher;

    fn make_header(parent: Point, slot: u64, number: u64, desc: &str) -> BlockHeader {
        let mut hasher = Hasher::<256>::new();
        hasher.input(&slot.to_le_bytes());
        hasher.input(desc.as_bytes());
        BlockHeader {
            hash: BlockHash::from(*hasher.finalize()),
            slot,
            number,
            parent,
            era: Era::Conway,
            bytes: desc.as_bytes().to_vec(),
        }
    }

    struct Harness {
        extension: ChainExtension,
        chain: Arc<ChainStore>,
        connections: Arc<ConnectionManager>,
        bus: Arc<EventBus<Event>>,
        fetch_requests: mpsc::Receiver<FetchRequest>,
    }

    fn harness() -> Harness {
        let bus = Arc::new(EventBus::new());
        let chain =
            Arc::new(ChainStore::new(Arc::new(MemoryStore::new()), 100, bus.clone()).unwrap());
        let mempool = Arc::new(Mempool::new(MempoolConfig::default(), bus.clone()));
        let connections = Arc::new(ConnectionManager::new(bus.clone()));
        let config = Arc::new(CardanoNodeConfig::new(2, String::new()));
        let (fetcher, fetch_requests) = mpsc::channel(16);
        let extension = ChainExtension::new(
            chain.clone(),
            bus.clone(),
            mempool,
            connections.clone(),
            config,
            fetcher,
        );
        Harness {
            extension,
            chain,
            connections,
            bus,
            fetch_requests,
        }
    }

    #[tokio::test]
    async fn roll_forward_requests_the_block_body() {
        let mut h = harness();
        let header = make_header(Point::Origin, 100, 1, "first");
        let event = ChainsyncEvent::RollForward {
            connection_id: ConnectionId(0),
            header: header.clone(),
            tip: Tip::new(header.point(), 1),
        };
        h.extension.handle_chainsync(&event).await;
        let request = h.fetch_requests.recv().await.unwrap();
        assert_eq!(
            request,
            FetchRequest {
                connection_id: ConnectionId(0),
                slot: 100,
                hash: header.hash,
            }
        );
    }

    #[tokio::test]
    async fn undecodable_body_drops_the_peer() {
        let mut h = harness();
        let id = h.connections.next_connection_id();
        let conn = dingo_connection_manager::Connection::new(
            id,
            "10.0.0.9:3001".into(),
            dingo_common::Direction::Outbound,
            false,
        );
        h.connections.add_connection(conn).unwrap();
        let mut closed = h.bus.subscribe(topics::CONNECTION_CLOSED);

        let header = make_header(Point::Origin, 100, 1, "first");
        let event = ChainsyncEvent::RollForward {
            connection_id: id,
            header: header.clone(),
            tip: Tip::new(header.point(), 1),
        };
        h.extension.handle_chainsync(&event).await;
        h.extension.handle_block_fetched(&BlockFetchedEvent {
            connection_id: id,
            slot: 100,
            hash: header.hash,
            body: b"not a block".to_vec(),
        });

        assert!(h.connections.get_connection_by_id(id).is_none());
        match closed.read().await.unwrap().as_ref() {
            Event::ConnectionClosed(event) => {
                assert_eq!(event.connection_id, id);
                assert!(event.error.as_deref().unwrap().contains("undecodable"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        // The chain is untouched
        assert_eq!(h.chain.tip(), Tip::ORIGIN);
    }

    #[tokio::test]
    async fn rollback_to_the_current_tip_is_a_no_op() {
        let mut h = harness();
        let tip = h.chain.tip();
        let event = ChainsyncEvent::RollBackward {
            connection_id: ConnectionId(0),
            point: tip.point,
            tip,
        };
        h.extension.handle_chainsync(&event).await;
        assert_eq!(h.chain.tip(), tip);
    }

    #[tokio::test]
    async fn bad_rollback_point_drops_the_peer() {
        let mut h = harness();
        let id = h.connections.next_connection_id();
        h.connections
            .add_connection(dingo_connection_manager::Connection::new(
                id,
                "10.0.0.9:3001".into(),
                dingo_common::Direction::Outbound,
                false,
            ))
            .unwrap();

        let missing = Point::specific(12345, BlockHash::default());
        let event = ChainsyncEvent::RollBackward {
            connection_id: id,
            point: missing,
            tip: Tip::ORIGIN,
        };
        h.extension.handle_chainsync(&event).await;
        assert!(h.connections.get_connection_by_id(id).is_none());
    }

    #[tokio::test]
    async fn unrequested_bodies_are_ignored() {
        let mut h = harness();
        h.extension.handle_block_fetched(&BlockFetchedEvent {
            connection_id: ConnectionId(0),
            slot: 100,
            hash: BlockHash::default(),
            body: vec![],
        });
        assert_eq!(h.chain.tip(), Tip::ORIGIN);
    }
}
