//! Node-to-client listener over a UNIX socket: chainsync in block mode,
//! local tx submission into the mempool, a minimal local state query
//! surface and the mempool monitor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use dingo_common::{Direction, Era, Point, Tip, TxHash};
use dingo_connection_manager::Connection;
use dingo_mempool::Mempool;
use pallas::codec::utils::AnyCbor;
use pallas::ledger::traverse::MultiEraTx;
use pallas::network::facades::NodeServer;
use pallas::network::miniprotocols::chainsync::{
    self, BlockContent, ClientRequest, Tip as WireTip,
};
use pallas::network::miniprotocols::localstate::{self, queries_v16, ClientQueryRequest};
use pallas::network::miniprotocols::localtxmonitor::{self, MempoolSizeAndCapacity};
use pallas::network::miniprotocols::localtxsubmission::{self, EraTx, RejectReason};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::chainsync::{ChainSyncServer, NextAction};
use crate::manager::NetworkShared;

pub async fn run_listener(path: PathBuf, shared: Arc<NetworkShared>) -> Result<()> {
    // A stale socket file from a previous run refuses rebinding
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("could not remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("could not listen on {}", path.display()))?;
    info!(path = %path.display(), "listening for node-to-client connections");
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = NodeServer::accept(&listener, shared.config.magic) => {
                match accepted {
                    Ok(server) => {
                        tokio::spawn(run_session(server, shared.clone()));
                    }
                    Err(err) => warn!("node-to-client handshake failed: {err:#}"),
                }
            }
        }
    }
}

async fn run_session(server: NodeServer, shared: Arc<NetworkShared>) {
    let id = shared.connections.next_connection_id();
    info!(connection_id = %id, "accepted local client");

    let conn = Connection::new(id, "local".to_string(), Direction::Inbound, false);
    let mut session_shutdown = conn.shutdown_signal();
    if let Err(err) = shared.connections.add_connection(conn) {
        warn!(connection_id = %id, "{err}");
        return;
    }

    let chainsync_handler =
        ChainSyncServer::new(shared.chain.clone(), shared.chainsync_state.clone());

    let mut chainsync_server = server.chainsync;
    let mut statequery_server = server.statequery;
    let mut txsubmission_server = server.localtxsubmission;
    let mut txmonitor_server = server.txmonitor;
    let plexer = server.plexer;

    let result = tokio::select! {
        r = run_chainsync(&mut chainsync_server, &chainsync_handler, id) => r,
        r = run_statequery(&mut statequery_server, &shared) => r,
        r = run_txsubmission(&mut txsubmission_server, &shared.mempool) => r,
        r = run_txmonitor(&mut txmonitor_server, &shared) => r,
        _ = wait_closed(&mut session_shutdown) => Ok(()),
    };
    plexer.abort().await;

    chainsync_handler.client_closed(id);
    let error = result.err().map(|err| format!("{err:#}"));
    if let Some(error) = &error {
        debug!(connection_id = %id, error, "local session ended");
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

/// Node-to-client chainsync serves whole blocks instead of headers
async fn run_chainsync(
    server: &mut chainsync::N2CServer,
    handler: &ChainSyncServer,
    id: dingo_common::ConnectionId,
) -> Result<()> {
    loop {
        match server.recv_while_idle().await? {
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
            Some(ClientRequest::RequestNext) => match handler.request_next(id).await? {
                NextAction::RollForward(block, tip) => {
                    server
                        .send_roll_forward(BlockContent(block.body.clone()), wire_tip(&tip))
                        .await?;
                }
                NextAction::RollBackward(point, tip) => {
                    server.send_roll_backward(point.into(), wire_tip(&tip)).await?;
                }
                NextAction::Await => {
                    server.send_await_reply().await?;
                    match handler.await_next(id).await? {
                        NextAction::RollForward(block, tip) => {
                            server
                                .send_roll_forward(BlockContent(block.body.clone()), wire_tip(&tip))
                                .await?;
                        }
                        NextAction::RollBackward(point, tip) => {
                            server.send_roll_backward(point.into(), wire_tip(&tip)).await?;
                        }
                        NextAction::Await => bail!("await resolved without an action"),
                    }
                }
            },
        }
    }
}

/// Trusted local submission: decode, hash, insert
async fn run_txsubmission(
    server: &mut localtxsubmission::Server,
    mempool: &Arc<Mempool>,
) -> Result<()> {
    loop {
        match server.recv_next_request().await? {
            localtxsubmission::Request::Submit(EraTx(era_id, body)) => {
                match submit(mempool, era_id, &body) {
                    Ok(hash) => {
                        debug!(%hash, "accepted local transaction");
                        server.accept_tx().await?;
                    }
                    Err(err) => {
                        warn!("rejected local transaction: {err}");
                        server.reject_tx(RejectReason(vec![])).await?;
                    }
                }
            }
            localtxsubmission::Request::Done => return Ok(()),
        }
    }
}

fn submit(mempool: &Mempool, era_id: u16, body: &[u8]) -> Result<TxHash> {
    let tx = MultiEraTx::decode(body).context("could not decode transaction")?;
    let hash = TxHash::from(*tx.hash());
    let era = u8::try_from(era_id)
        .ok()
        .and_then(|id| Era::try_from(id).ok())
        .unwrap_or(Era::Conway);
    mempool.add_transaction(hash, era, body.to_vec())?;
    Ok(hash)
}

/// Minimal local state query surface: chain point and block number
async fn run_statequery(
    server: &mut localstate::Server,
    shared: &Arc<NetworkShared>,
) -> Result<()> {
    loop {
        let Some(_acquire) = server.recv_while_idle().await? else {
            return Ok(());
        };
        // Queries always run against the current tip snapshot
        server.send_acquired().await?;
        loop {
            match server.recv_while_acquired().await? {
                ClientQueryRequest::Query(query) => {
                    let response = answer_query(shared, query);
                    server.send_result(response).await?;
                }
                ClientQueryRequest::ReAcquire(_) => server.send_acquired().await?,
                ClientQueryRequest::Release => break,
            }
        }
    }
}

fn answer_query(shared: &Arc<NetworkShared>, query: AnyCbor) -> AnyCbor {
    let tip = shared.chain.tip();
    match query.into_decode::<queries_v16::Request>() {
        Ok(queries_v16::Request::GetChainPoint) => {
            let point: pallas::network::miniprotocols::Point = tip.point.into();
            AnyCbor::from_encode(point)
        }
        Ok(queries_v16::Request::GetChainBlockNo) => {
            AnyCbor::from_encode((1u8, tip.block_number))
        }
        Ok(other) => {
            debug!("unsupported local state query: {other:?}");
            AnyCbor::from_encode(0u8)
        }
        Err(err) => {
            warn!("undecodable local state query: {err}");
            AnyCbor::from_encode(0u8)
        }
    }
}

/// Mempool monitor: snapshot on acquire, then iterate
async fn run_txmonitor(
    server: &mut localtxmonitor::Server,
    shared: &Arc<NetworkShared>,
) -> Result<()> {
    loop {
        let Some(_req) = server.recv_while_idle().await? else {
            return Ok(());
        };
        let mut snapshot = shared.mempool.transactions().into_iter();
        let slot = shared.chain.tip().point.slot_or_default();
        server.send_acquired(slot).await?;
        loop {
            match server.recv_while_acquired().await? {
                localtxmonitor::ClientRequest::NextTx => {
                    let next = snapshot.next().map(|entry| (u16::from(entry.era), entry.bytes));
                    server.send_next_tx(next).await?;
                }
                localtxmonitor::ClientRequest::HasTx(id) => {
                    let known = TxHash::try_from(id.as_slice())
                        .map(|hash| shared.mempool.get(&hash).is_some())
                        .unwrap_or(false);
                    server.send_has_tx(known).await?;
                }
                localtxmonitor::ClientRequest::GetSizes => {
                    let entries = shared.mempool.transactions();
                    let sizes = MempoolSizeAndCapacity {
                        capacity_in_bytes: 0,
                        size_in_bytes: entries.iter().map(|e| e.bytes.len() as u32).sum(),
                        number_of_txs: entries.len() as u32,
                    };
                    server.send_get_sizes(sizes).await?;
                }
                localtxmonitor::ClientRequest::Release => break,
            }
        }
    }
}
