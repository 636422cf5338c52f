//! Event types exchanged on the node's event bus

use crate::hash::{BlockHash, TxHash};
use crate::types::{BlockHeader, ConnectionId, Era, Point, Tip};

/// Topic names, one per event kind
pub mod topics {
    /// Headers and rollbacks reported by chainsync clients
    pub const CHAINSYNC: &str = "network.chainsync";
    /// Block bodies fetched from upstream peers
    pub const BLOCKFETCH: &str = "network.blockfetch";
    /// New inbound peer sessions
    pub const INBOUND_CONNECTION: &str = "connmanager.inbound-conn";
    /// Closed peer sessions, either direction
    pub const CONNECTION_CLOSED: &str = "connmanager.conn-closed";
    /// Canonical chain changes applied by the chain store
    pub const CHAIN_UPDATE: &str = "chain.update";
    /// Transactions accepted into the mempool
    pub const MEMPOOL_ADD_TX: &str = "mempool.add-tx";
}

/// Everything that can travel on the bus
#[derive(Debug, Clone)]
pub enum Event {
    Chainsync(ChainsyncEvent),
    BlockFetched(BlockFetchedEvent),
    InboundConnection(InboundConnectionEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ChainUpdate(ChainUpdateEvent),
    MempoolAddTransaction(MempoolAddTransactionEvent),
}

/// Published by a chainsync client for every message from its upstream peer
#[derive(Debug, Clone)]
pub enum ChainsyncEvent {
    RollForward {
        connection_id: ConnectionId,
        header: BlockHeader,
        tip: Tip,
    },
    RollBackward {
        connection_id: ConnectionId,
        point: Point,
        tip: Tip,
    },
}

/// Raw body bytes for a previously requested block; the chain-extension
/// pipeline validates header/body linkage before constructing a block
#[derive(Debug, Clone)]
pub struct BlockFetchedEvent {
    pub connection_id: ConnectionId,
    pub slot: u64,
    pub hash: BlockHash,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InboundConnectionEvent {
    pub connection_id: ConnectionId,
    pub remote_address: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionClosedEvent {
    pub connection_id: ConnectionId,
    pub error: Option<String>,
}

/// Published by the chain store whenever the canonical chain changes
#[derive(Debug, Clone)]
pub enum ChainUpdateEvent {
    BlockApplied { point: Point, tip: Tip },
    RolledBack { point: Point, tip: Tip },
}

#[derive(Debug, Clone)]
pub struct MempoolAddTransactionEvent {
    pub hash: TxHash,
    pub era: Era,
}

/// Request from the chain-extension pipeline to fetch a block body from the
/// peer which announced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub connection_id: ConnectionId,
    pub slot: u64,
    pub hash: BlockHash,
}
