//! TxSubmission handler logic.
//!
//! As a server we pull transactions from a remote peer's mempool into our
//! own; as a client we serve our mempool to a remote puller straight from
//! its per-peer delivery window. The wire loops live in the session
//! drivers; the decode/dedup/accounting logic lives here.

use std::sync::Arc;

use dingo_common::{ConnectionId, Era, TxHash};
use dingo_mempool::{Mempool, MempoolError};
use pallas::ledger::traverse::MultiEraTx;
use tracing::{debug, warn};

/// How many tx ids a server-side pull requests at a time
pub const TX_REQUEST_COUNT: u16 = 16;

pub struct TxSubmissionServerHandler {
    mempool: Arc<Mempool>,
}

impl TxSubmissionServerHandler {
    pub fn new(mempool: Arc<Mempool>) -> Self {
        Self { mempool }
    }

    /// Filter announced ids down to the ones we still need to download
    pub fn wanted_ids(&self, ids: Vec<(u16, Vec<u8>)>) -> Vec<(u16, Vec<u8>)> {
        ids.into_iter()
            .filter(|(_, id)| match TxHash::try_from(id.as_slice()) {
                Ok(hash) => self.mempool.get(&hash).is_none(),
                Err(_) => {
                    warn!("peer announced a malformed tx id");
                    false
                }
            })
            .collect()
    }

    /// Insert downloaded bodies; returns how many were accepted
    pub fn accept_bodies(&self, bodies: Vec<(u16, Vec<u8>)>) -> usize {
        let mut accepted = 0;
        for (era_id, body) in bodies {
            match self.insert_body(era_id, body) {
                Ok(hash) => {
                    debug!(%hash, "transaction pulled from peer");
                    accepted += 1;
                }
                Err(err) => warn!("rejected peer transaction: {err}"),
            }
        }
        accepted
    }

    fn insert_body(&self, era_id: u16, body: Vec<u8>) -> anyhow::Result<TxHash> {
        let tx = MultiEraTx::decode(&body)?;
        let hash = TxHash::from(*tx.hash());
        let era = u8::try_from(era_id)
            .ok()
            .and_then(|id| Era::try_from(id).ok())
            .unwrap_or(Era::Conway);
        self.mempool
            .add_transaction(hash, era, body)
            .map_err(|err: MempoolError| anyhow::anyhow!(err))?;
        Ok(hash)
    }
}

/// Client-side view over the mempool for one remote puller
pub struct TxSubmissionClientHandler {
    mempool: Arc<Mempool>,
    connection_id: ConnectionId,
}

impl TxSubmissionClientHandler {
    pub fn new(mempool: Arc<Mempool>, connection_id: ConnectionId) -> Self {
        mempool.register_peer(connection_id);
        Self {
            mempool,
            connection_id,
        }
    }

    pub fn acknowledge(&self, count: u16) {
        self.mempool.acknowledge(self.connection_id, count as usize);
    }

    /// Next announcements for this peer as (era, id, size) triples
    pub fn announce(&self, count: u16) -> Vec<(u16, Vec<u8>, u32)> {
        self.mempool
            .deliver_ids(self.connection_id, count as usize)
            .into_iter()
            .map(|entry| {
                (
                    u16::from(entry.era),
                    entry.hash.to_vec(),
                    entry.bytes.len() as u32,
                )
            })
            .collect()
    }

    /// Await a new mempool entry, for blocking id requests
    pub async fn wait_for_transaction(&self) {
        self.mempool.wait_for_transaction().await;
    }

    /// Requested bodies, skipping anything already evicted
    pub fn bodies(&self, ids: Vec<Vec<u8>>) -> Vec<(u16, Vec<u8>)> {
        ids.into_iter()
            .filter_map(|id| {
                let hash = TxHash::try_from(id.as_slice()).ok()?;
                let entry = self.mempool.window_tx(self.connection_id, &hash);
                if entry.is_none() {
                    warn!(connection_id = %self.connection_id, "peer requested an unknown tx");
                }
                entry
            })
            .map(|entry| (u16::from(entry.era), entry.bytes))
            .collect()
    }

    /// Session teardown; unpins this peer's window
    pub fn closed(&self) {
        self.mempool.unregister_peer(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_event_bus::EventBus;
    use dingo_mempool::MempoolConfig;

    fn mempool() -> Arc<Mempool> {
        Arc::new(Mempool::new(MempoolConfig::default(), Arc::new(EventBus::new())))
    }

    #[test]
    fn wanted_ids_skips_known_and_malformed_entries() {
        let mempool = mempool();
        let known = TxHash::new([1; 32]);
        mempool.add_transaction(known, Era::Conway, vec![1]).unwrap();
        let handler = TxSubmissionServerHandler::new(mempool);

        let wanted = handler.wanted_ids(vec![
            (6, known.to_vec()),
            (6, vec![2; 32]),
            (6, vec![3; 7]),
        ]);
        assert_eq!(wanted, vec![(6, vec![2; 32])]);
    }

    #[test]
    fn undecodable_bodies_are_rejected_without_poisoning_the_mempool() {
        let mempool = mempool();
        let handler = TxSubmissionServerHandler::new(mempool.clone());
        let accepted = handler.accept_bodies(vec![(6, b"garbage".to_vec())]);
        assert_eq!(accepted, 0);
        assert!(mempool.is_empty());
    }

    #[test]
    fn client_serves_announcements_and_bodies_from_the_window() {
        let mempool = mempool();
        let peer = ConnectionId(3);
        let hash = TxHash::new([9; 32]);
        mempool.add_transaction(hash, Era::Conway, vec![0xca, 0xfe]).unwrap();
        let handler = TxSubmissionClientHandler::new(mempool, peer);

        let announced = handler.announce(4);
        assert_eq!(announced, vec![(6, hash.to_vec(), 2)]);

        let bodies = handler.bodies(vec![hash.to_vec()]);
        assert_eq!(bodies, vec![(6, vec![0xca, 0xfe])]);

        // After acknowledgement the body is no longer pinned to the window
        handler.acknowledge(1);
        assert!(handler.bodies(vec![hash.to_vec()]).is_empty());
    }
}
