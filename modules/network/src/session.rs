//! One outbound peer session: bearer dialing, handshake, and the client
//! sides of the node-to-node mini-protocols multiplexed over it.
//!
//! The plexer is assembled by hand rather than through the facade so the
//! dialer can bind a configured local source port (peer-sharing
//! reciprocity requires inbound and outbound traffic to share a port).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use dingo_common::messages::{topics, BlockFetchedEvent, Event};
use dingo_common::{BlockHash, ConnectionId, Point, Tip};
use dingo_event_bus::EventBus;
use dingo_mempool::Mempool;
use pallas::network::miniprotocols::{
    blockfetch,
    chainsync::{self, NextResponse},
    handshake, keepalive, txsubmission,
    PROTOCOL_N2N_BLOCK_FETCH, PROTOCOL_N2N_CHAIN_SYNC, PROTOCOL_N2N_HANDSHAKE,
    PROTOCOL_N2N_KEEP_ALIVE, PROTOCOL_N2N_TX_SUBMISSION,
};
use pallas::network::multiplexer::{Bearer, Plexer};
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::chainsync::{parse_header_content, ChainSyncClient};
use crate::txsubmission::TxSubmissionClientHandler;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub magic: u64,
    /// Local source port for outbound dials; enables peer-sharing
    /// reciprocity when set
    pub source_port: Option<u16>,
}

enum ChainsyncCommand {
    Sync(Vec<Point>),
    FindTip(oneshot::Sender<Point>),
}

enum BlockfetchCommand {
    Fetch(BlockHash, u64),
}

/// Handle to a live outbound session. Commands are serviced by the
/// session worker; the worker exits when the peer disconnects, a protocol
/// errors, or shutdown is signalled.
pub struct PeerSession {
    pub connection_id: ConnectionId,
    pub address: String,
    chainsync: mpsc::UnboundedSender<ChainsyncCommand>,
    blockfetch: mpsc::UnboundedSender<BlockfetchCommand>,
}

impl PeerSession {
    /// Begin chainsync from the first of `points` the peer recognizes
    pub fn sync(&self, points: Vec<Point>) -> Result<()> {
        self.chainsync
            .send(ChainsyncCommand::Sync(points))
            .map_err(|_| anyhow::anyhow!("session worker has stopped"))
    }

    /// Ask the peer for its current tip without starting to sync
    pub async fn find_tip(&self) -> Result<Point> {
        let (reply, response) = oneshot::channel();
        self.chainsync
            .send(ChainsyncCommand::FindTip(reply))
            .map_err(|_| anyhow::anyhow!("session worker has stopped"))?;
        response.await.context("session worker has stopped")
    }

    /// Request a block body; the result arrives as a blockfetch bus event
    pub fn request_block(&self, hash: BlockHash, slot: u64) -> Result<()> {
        self.blockfetch
            .send(BlockfetchCommand::Fetch(hash, slot))
            .map_err(|_| anyhow::anyhow!("session worker has stopped"))
    }

    /// Dial, handshake and spawn the session worker. Returns the command
    /// handle plus the worker's join handle; the worker resolves to the
    /// error that ended the session, if any.
    pub async fn establish(
        connection_id: ConnectionId,
        address: String,
        config: &SessionConfig,
        bus: Arc<EventBus<Event>>,
        mempool: Arc<Mempool>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<Option<String>>)> {
        debug!(%connection_id, address, "establishing TCP connection");
        let bearer = tokio::time::timeout(DIAL_TIMEOUT, dial(&address, config))
            .await
            .context("dial timed out")??;

        let mut plexer = Plexer::new(bearer);
        let handshake_channel = plexer.subscribe_client(PROTOCOL_N2N_HANDSHAKE);
        let chainsync_channel = plexer.subscribe_client(PROTOCOL_N2N_CHAIN_SYNC);
        let blockfetch_channel = plexer.subscribe_client(PROTOCOL_N2N_BLOCK_FETCH);
        let txsubmission_channel = plexer.subscribe_client(PROTOCOL_N2N_TX_SUBMISSION);
        let keepalive_channel = plexer.subscribe_client(PROTOCOL_N2N_KEEP_ALIVE);
        let running = plexer.spawn();

        debug!(%connection_id, address, "negotiating ouroboros handshake");
        let mut handshake_client = handshake::Client::new(handshake_channel);
        let confirmation = handshake_client
            .handshake(handshake::n2n::VersionTable::v7_and_above(config.magic))
            .await
            .context("handshake failed");
        let confirmation = match confirmation {
            Ok(confirmation) => confirmation,
            Err(err) => {
                running.abort().await;
                return Err(err);
            }
        };
        let handshake::Confirmation::Accepted(version, _) = confirmation else {
            running.abort().await;
            bail!("handshake refused by {address}");
        };
        debug!(%connection_id, address, version, "handshake complete");

        let (chainsync_tx, chainsync_rx) = mpsc::unbounded_channel();
        let (blockfetch_tx, blockfetch_rx) = mpsc::unbounded_channel();

        let session = Self {
            connection_id,
            address: address.clone(),
            chainsync: chainsync_tx,
            blockfetch: blockfetch_tx,
        };

        let worker = SessionWorker {
            connection_id,
            address,
            bus,
            mempool,
        };
        let handle = tokio::spawn(worker.run(
            chainsync::N2NClient::new(chainsync_channel),
            blockfetch::Client::new(blockfetch_channel),
            txsubmission::Client::new(txsubmission_channel),
            keepalive::Client::new(keepalive_channel),
            running,
            chainsync_rx,
            blockfetch_rx,
            shutdown,
        ));
        Ok((session, handle))
    }
}

async fn dial(address: &str, config: &SessionConfig) -> Result<Bearer> {
    let Some(port) = config.source_port else {
        return Bearer::connect_tcp(address)
            .await
            .with_context(|| format!("could not connect to {address}"));
    };
    let remote = tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("could not resolve {address}"))?
        .next()
        .with_context(|| format!("no addresses for {address}"))?;
    let (socket, local): (TcpSocket, SocketAddr) = if remote.is_ipv4() {
        (TcpSocket::new_v4()?, (Ipv4Addr::UNSPECIFIED, port).into())
    } else {
        (TcpSocket::new_v6()?, (Ipv6Addr::UNSPECIFIED, port).into())
    };
    // Sharing the listen port requires both flags; the peer can then dial
    // us back on the port it observed.
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(local)?;
    let stream = socket
        .connect(remote)
        .await
        .with_context(|| format!("could not connect to {address}"))?;
    Ok(Bearer::Tcp(stream))
}

struct SessionWorker {
    connection_id: ConnectionId,
    address: String,
    bus: Arc<EventBus<Event>>,
    mempool: Arc<Mempool>,
}

impl SessionWorker {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        self,
        chainsync: chainsync::N2NClient,
        blockfetch: blockfetch::Client,
        txsubmission: txsubmission::Client,
        keepalive: keepalive::Client,
        running: pallas::network::multiplexer::RunningPlexer,
        chainsync_commands: mpsc::UnboundedReceiver<ChainsyncCommand>,
        blockfetch_commands: mpsc::UnboundedReceiver<BlockfetchCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<String> {
        let events = ChainSyncClient::new(self.bus.clone(), self.connection_id);
        let tx_handler =
            TxSubmissionClientHandler::new(self.mempool.clone(), self.connection_id);
        let result = tokio::select! {
            r = self.run_chainsync(chainsync, chainsync_commands, events) => r,
            r = self.run_blockfetch(blockfetch, blockfetch_commands) => r,
            r = Self::run_txsubmission(txsubmission, &tx_handler) => r,
            r = Self::run_keepalive(keepalive) => r,
            _ = wait_shutdown(&mut shutdown) => Ok(()),
        };
        tx_handler.closed();
        running.abort().await;
        match result {
            Ok(()) => None,
            Err(err) => {
                error!(connection_id = %self.connection_id, peer = self.address, "{err:#}");
                Some(format!("{err:#}"))
            }
        }
    }

    async fn run_chainsync(
        &self,
        mut client: chainsync::N2NClient,
        mut commands: mpsc::UnboundedReceiver<ChainsyncCommand>,
        events: ChainSyncClient,
    ) -> Result<()> {
        let mut syncing = false;
        loop {
            tokio::select! {
                msg = client.request_or_await_next(), if syncing => {
                    match msg? {
                        NextResponse::RollForward(content, tip) => {
                            let tip = convert_tip(&tip)?;
                            if let Some(header) = parse_header_content(&content)? {
                                events.roll_forward(header, tip);
                            }
                        }
                        NextResponse::RollBackward(point, tip) => {
                            let tip = convert_tip(&tip)?;
                            events.roll_backward(point.try_into()?, tip);
                        }
                        NextResponse::Await => {}
                    }
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        bail!("session handle dropped");
                    };
                    if !client.has_agency() {
                        // We cannot run find_intersect while a RequestNext
                        // is outstanding; drain it first.
                        client.recv_while_must_reply().await?;
                    }
                    match cmd {
                        ChainsyncCommand::Sync(points) => {
                            let candidates =
                                points.into_iter().map(Into::into).collect();
                            let (point, _) = client.find_intersect(candidates).await?;
                            if point.is_none() {
                                bail!("intersect not found on {}", self.address);
                            }
                            syncing = true;
                        }
                        ChainsyncCommand::FindTip(reply) => {
                            let (_, tip) = client.find_intersect(vec![]).await?;
                            let tip = convert_tip(&tip)?;
                            if reply.send(tip.point).is_err() {
                                bail!("session handle dropped");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_blockfetch(
        &self,
        mut client: blockfetch::Client,
        mut commands: mpsc::UnboundedReceiver<BlockfetchCommand>,
    ) -> Result<()> {
        while let Some(BlockfetchCommand::Fetch(hash, slot)) = commands.recv().await {
            let point = pallas::network::miniprotocols::Point::Specific(slot, hash.to_vec());
            let body = client.fetch_single(point).await?;
            self.bus.publish(
                topics::BLOCKFETCH,
                Arc::new(Event::BlockFetched(BlockFetchedEvent {
                    connection_id: self.connection_id,
                    slot,
                    hash,
                    body,
                })),
            );
        }
        bail!("session handle dropped");
    }

    async fn run_txsubmission(
        mut client: txsubmission::Client,
        handler: &TxSubmissionClientHandler,
    ) -> Result<()> {
        client.send_init().await.context("txsubmission init failed")?;
        loop {
            let request = client.next_request().await.context("txsubmission request failed")?;
            match request {
                txsubmission::Request::TxIds(ack, req) => {
                    handler.acknowledge(ack);
                    let mut ids = handler.announce(req);
                    while ids.is_empty() {
                        handler.wait_for_transaction().await;
                        ids = handler.announce(req);
                    }
                    client.reply_tx_ids(to_wire_ids(ids)).await?;
                }
                txsubmission::Request::TxIdsNonBlocking(ack, req) => {
                    handler.acknowledge(ack);
                    client.reply_tx_ids(to_wire_ids(handler.announce(req))).await?;
                }
                txsubmission::Request::Txs(ids) => {
                    let wanted = ids.into_iter().map(|id| id.1).collect();
                    let bodies = handler
                        .bodies(wanted)
                        .into_iter()
                        .map(|(era, body)| txsubmission::EraTxBody(era, body))
                        .collect();
                    client.reply_txs(bodies).await?;
                }
            }
        }
    }

    async fn run_keepalive(mut client: keepalive::Client) -> Result<()> {
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        // The first tick fires immediately; skip it so the handshake is
        // not immediately followed by a probe.
        interval.tick().await;
        loop {
            interval.tick().await;
            client.keepalive_roundtrip().await.context("keepalive failed")?;
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn to_wire_ids(
    ids: Vec<(u16, Vec<u8>, u32)>,
) -> Vec<txsubmission::TxIdAndSize<txsubmission::EraTxId>> {
    ids.into_iter()
        .map(|(era, id, size)| {
            txsubmission::TxIdAndSize(txsubmission::EraTxId(era, id), size)
        })
        .collect()
}

fn convert_tip(tip: &chainsync::Tip) -> Result<Tip> {
    Ok(Tip::new(tip.0.clone().try_into()?, tip.1))
}
