//! Inbound node-to-node listener: accept a peer, handshake through the
//! pallas facade, then serve the chainsync, blockfetch, txsubmission and
//! peersharing server sides until the client leaves or errors.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use dingo_common::{Direction, Point, Tip};
use dingo_connection_manager::Connection;
use pallas::network::facades::PeerServer;
use pallas::network::miniprotocols::chainsync::{
    self, ClientRequest, HeaderContent, Tip as WireTip,
};
use pallas::network::miniprotocols::{blockfetch, peersharing, txsubmission};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::blockfetch::BlockFetchServer;
use crate::chainsync::{ChainSyncServer, NextAction};
use crate::manager::NetworkShared;
use crate::peersharing::PeerSharingHandler;
use crate::txsubmission::{TxSubmissionServerHandler, TX_REQUEST_COUNT};

pub async fn run_listener(address: String, shared: Arc<NetworkShared>) -> Result<()> {
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("could not listen on {address}"))?;
    info!(address, "listening for node-to-node connections");
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = PeerServer::accept(&listener, shared.config.magic) => {
                match accepted {
                    Ok(server) => {
                        tokio::spawn(run_session(server, shared.clone()));
                    }
                    Err(err) => warn!("inbound handshake failed: {err:#}"),
                }
            }
        }
    }
}

async fn run_session(server: PeerServer, shared: Arc<NetworkShared>) {
    let id = shared.connections.next_connection_id();
    let address = server
        .accepted_address()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(connection_id = %id, address, "accepted peer connection");

    let conn = Connection::new(id, address.clone(), Direction::Inbound, false);
    let mut session_shutdown = conn.shutdown_signal();
    if let Err(err) = shared.connections.add_connection(conn) {
        warn!(connection_id = %id, "{err}");
        return;
    }

    let chainsync_handler =
        ChainSyncServer::new(shared.chain.clone(), shared.chainsync_state.clone());
    let blockfetch_handler = BlockFetchServer::new(shared.chain.clone());
    let txsubmission_handler = TxSubmissionServerHandler::new(shared.mempool.clone());
    let peersharing_handler = PeerSharingHandler::new(shared.connections.clone());

    let mut chainsync_server = server.chainsync;
    let mut blockfetch_server = server.blockfetch;
    let mut txsubmission_server = server.txsubmission;
    let mut peersharing_server = server.peersharing;
    let plexer = server.plexer;

    let result = tokio::select! {
        r = run_chainsync(&mut chainsync_server, &chainsync_handler, id) => r,
        r = run_blockfetch(&mut blockfetch_server, &blockfetch_handler) => r,
        r = run_txsubmission(&mut txsubmission_server, &txsubmission_handler) => r,
        r = run_peersharing(&mut peersharing_server, &peersharing_handler) => r,
        _ = wait_closed(&mut session_shutdown) => Ok(()),
    };
    plexer.abort().await;

    chainsync_handler.client_closed(id);
    let error = result.err().map(|err| format!("{err:#}"));
    if let Some(error) = &error {
        debug!(connection_id = %id, error, "peer session ended");
    }
    shared.connections.remove_connection(id, error);
}

async fn wait_closed(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn wire_tip(tip: &Tip) -> WireTip {
    WireTip(tip.point.into(), tip.block_number)
}

fn header_content(block: &dingo_common::Block) -> HeaderContent {
    let variant = u8::from(block.era());
    HeaderContent {
        variant,
        byron_prefix: (variant == 0).then_some((1, 0)),
        cbor: block.header.bytes.clone(),
    }
}

async fn run_chainsync(
    server: &mut chainsync::N2NServer,
    handler: &ChainSyncServer,
    id: dingo_common::ConnectionId,
) -> Result<()> {
    loop {
        match server.recv_while_idle().await? {
            // Client sent Done
            None => return Ok(()),
            Some(ClientRequest::Intersect(points)) => {
                let points: Vec<Point> = points
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_>>()?;
                match handler.find_intersect(id, &points)? {
                    (Some(point), tip) => {
                        server.send_intersect_found(point.into(), wire_tip(&tip)).await?;
                    }
                    (None, tip) => server.send_intersect_not_found(wire_tip(&tip)).await?,
                }
            }
            Some(ClientRequest::RequestNext) => {
                match handler.request_next(id).await? {
                    NextAction::RollForward(block, tip) => {
                        server.send_roll_forward(header_content(&block), wire_tip(&tip)).await?;
                    }
                    NextAction::RollBackward(point, tip) => {
                        server.send_roll_backward(point.into(), wire_tip(&tip)).await?;
                    }
                    NextAction::Await => {
                        server.send_await_reply().await?;
                        // The session task itself parks here; shutdown or
                        // chain-store closure cancels the wait.
                        match handler.await_next(id).await? {
                            NextAction::RollForward(block, tip) => {
                                server
                                    .send_roll_forward(header_content(&block), wire_tip(&tip))
                                    .await?;
                            }
                            NextAction::RollBackward(point, tip) => {
                                server.send_roll_backward(point.into(), wire_tip(&tip)).await?;
                            }
                            NextAction::Await => bail!("await resolved without an action"),
                        }
                    }
                }
            }
        }
    }
}

async fn run_blockfetch(
    server: &mut blockfetch::Server,
    handler: &BlockFetchServer,
) -> Result<()> {
    loop {
        let Some(request) = server.recv_while_idle().await? else {
            return Ok(());
        };
        let (from, to) = request.0;
        let range = match (Point::try_from(from), Point::try_from(to)) {
            (Ok(from), Ok(to)) => handler.resolve_range(from, to),
            _ => None,
        };
        match range {
            Some(blocks) => {
                server.send_start_batch().await?;
                for block in blocks {
                    server.send_block(block.body.clone()).await?;
                }
                server.send_batch_done().await?;
            }
            None => server.send_no_blocks().await?,
        }
    }
}

async fn run_txsubmission(
    server: &mut txsubmission::Server,
    handler: &TxSubmissionServerHandler,
) -> Result<()> {
    server.wait_for_init().await?;
    let mut acknowledge: u16 = 0;
    loop {
        server
            .acknowledge_and_request_tx_ids(true, acknowledge, TX_REQUEST_COUNT)
            .await?;
        let reply = server.receive_next_reply().await?;
        let ids = match reply {
            txsubmission::Reply::TxIds(ids) => ids,
            txsubmission::Reply::Done => return Ok(()),
            txsubmission::Reply::Txs(_) => bail!("unsolicited tx bodies"),
        };
        let announced = ids.len() as u16;
        let ids: Vec<(u16, Vec<u8>)> = ids
            .into_iter()
            .map(|txsubmission::TxIdAndSize(txsubmission::EraTxId(era, id), _)| (era, id))
            .collect();
        let wanted = handler.wanted_ids(ids);
        if wanted.is_empty() {
            acknowledge = announced;
            continue;
        }
        let request: Vec<txsubmission::EraTxId> = wanted
            .iter()
            .map(|(era, id)| txsubmission::EraTxId(*era, id.clone()))
            .collect();
        server.request_txs(request).await?;
        match server.receive_next_reply().await? {
            txsubmission::Reply::Txs(bodies) => {
                let bodies = bodies
                    .into_iter()
                    .map(|txsubmission::EraTxBody(era, body)| (era, body))
                    .collect();
                handler.accept_bodies(bodies);
            }
            txsubmission::Reply::Done => return Ok(()),
            txsubmission::Reply::TxIds(_) => bail!("unsolicited tx ids"),
        }
        acknowledge = announced;
    }
}

async fn run_peersharing(
    server: &mut peersharing::Server,
    handler: &PeerSharingHandler,
) -> Result<()> {
    loop {
        let Some(amount) = server.recv_share_request().await? else {
            return Ok(());
        };
        server.send_peer_addresses(handler.sharable_addresses(amount)).await?;
    }
}
