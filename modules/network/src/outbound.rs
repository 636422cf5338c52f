//! Topology-driven outbound dialer.
//!
//! One worker per configured peer: dial, handshake, register, claim the
//! upstream chainsync-client role if vacant, then babysit the session.
//! Failures at any stage feed an exponential backoff that starts at 1 s,
//! doubles per failed attempt and caps at 128 s; a successful connection
//! resets both the counter and the delay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use dingo_common::params::CHAINSYNC_INTERSECT_POINT_COUNT;
use dingo_common::topology::TopologyConfig;
use dingo_common::{Direction, Point};
use dingo_connection_manager::Connection;
use tracing::{debug, info, warn};

use crate::manager::NetworkShared;
use crate::session::PeerSession;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(128);
const RECONNECT_BACKOFF_FACTOR: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPeer {
    pub address: String,
    pub sharable: bool,
    pub reconnect_count: u32,
    pub reconnect_delay: Duration,
}

impl OutboundPeer {
    fn new(address: String, sharable: bool) -> Self {
        Self {
            address,
            sharable,
            reconnect_count: 0,
            reconnect_delay: Duration::ZERO,
        }
    }
}

/// The delay to apply after one more failed attempt
pub fn next_reconnect_delay(current: Duration) -> Duration {
    if current.is_zero() {
        INITIAL_RECONNECT_DELAY
    } else {
        (current * RECONNECT_BACKOFF_FACTOR).min(MAX_RECONNECT_DELAY)
    }
}

/// Flatten the topology document into dial targets: bootstrap peers, then
/// local roots, then public roots
pub fn topology_peers(topology: &TopologyConfig) -> Vec<OutboundPeer> {
    let mut peers = vec![];
    for host in &topology.bootstrap_peers {
        debug!(address = host.endpoint(), "adding bootstrap peer");
        peers.push(OutboundPeer::new(host.endpoint(), false));
    }
    for root in &topology.local_roots {
        for host in &root.access_points {
            debug!(address = host.endpoint(), "adding local root peer");
            peers.push(OutboundPeer::new(host.endpoint(), root.advertise));
        }
    }
    for root in &topology.public_roots {
        for host in &root.access_points {
            debug!(address = host.endpoint(), "adding public root peer");
            peers.push(OutboundPeer::new(host.endpoint(), root.advertise));
        }
    }
    peers
}

pub fn start(shared: Arc<NetworkShared>, topology: &TopologyConfig) {
    debug!("starting outbound connections");
    for peer in topology_peers(topology) {
        let shared = shared.clone();
        tokio::spawn(worker(shared, peer));
    }
}

async fn worker(shared: Arc<NetworkShared>, mut peer: OutboundPeer) {
    loop {
        if *shared.shutdown.borrow() {
            return;
        }
        if let Err(err) = run_connection(&shared, &mut peer).await {
            warn!(address = peer.address, "outbound connection failed: {err:#}");
        }
        if *shared.shutdown.borrow() {
            return;
        }
        peer.reconnect_delay = next_reconnect_delay(peer.reconnect_delay);
        peer.reconnect_count += 1;
        info!(
            address = peer.address,
            retry = peer.reconnect_count,
            "delaying {:?} before reconnecting",
            peer.reconnect_delay
        );
        let mut shutdown = shared.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(peer.reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One full connection lifetime: establish, serve, tear down. Returns
/// `Err` both for failed dials and for sessions that ended with an error.
async fn run_connection(shared: &Arc<NetworkShared>, peer: &mut OutboundPeer) -> Result<()> {
    let id = shared.connections.next_connection_id();
    let conn = Connection::new(id, peer.address.clone(), Direction::Outbound, peer.sharable);
    let session_shutdown = conn.shutdown_signal();

    let (session, worker) = PeerSession::establish(
        id,
        peer.address.clone(),
        &shared.session_config(),
        shared.bus.clone(),
        shared.mempool.clone(),
        session_shutdown,
    )
    .await?;

    info!(connection_id = %id, address = peer.address, "connected to peer");
    peer.reconnect_count = 0;
    peer.reconnect_delay = Duration::ZERO;

    let conn = shared.connections.add_connection(conn)?;
    let session = Arc::new(session);
    shared.register_session(session.clone());

    // Claim the single upstream chainsync-client role if nobody holds it
    if shared.chainsync_state.claim_primary(id) {
        info!(connection_id = %id, address = peer.address, "assuming primary chainsync client role");
        if let Err(err) = start_chainsync_client(&session, shared).await {
            shared.teardown_session(id, Some(format!("could not start chainsync: {err:#}")));
            bail!("could not start chainsync on {}: {err:#}", peer.address);
        }
    }

    // Park until the session worker exits, then clean up
    let error = match worker.await {
        Ok(error) => error,
        Err(_) => Some("session worker panicked".to_string()),
    };
    drop(conn);
    shared.teardown_session(id, error.clone());
    match error {
        None => Ok(()),
        Some(error) => bail!("{error}"),
    }
}

/// Start syncing from this peer, spec'd intersect selection: recent chain
/// points first, then the configured start (peer tip or explicit points),
/// then origin
pub(crate) async fn start_chainsync_client(
    session: &PeerSession,
    shared: &NetworkShared,
) -> Result<()> {
    let mut candidates = shared.chain.recent_chain_points(CHAINSYNC_INTERSECT_POINT_COUNT);
    if candidates.is_empty() {
        if shared.config.intersect_tip {
            let tip = session.find_tip().await?;
            candidates = vec![tip];
        } else if !shared.config.intersect_points.is_empty() {
            candidates = shared.config.intersect_points.clone();
        } else {
            candidates = vec![Point::Origin];
        }
    }
    session.sync(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_common::topology::{AccessPoint, RootGroup};

    #[test]
    fn backoff_follows_the_doubling_schedule_with_a_cap() {
        let mut delay = Duration::ZERO;
        let mut observed = vec![];
        for _ in 0..10 {
            delay = next_reconnect_delay(delay);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 64, 128, 128, 128]);
    }

    #[test]
    fn topology_flattens_to_peers_with_advertise_flags() {
        let topology = TopologyConfig {
            bootstrap_peers: vec![AccessPoint {
                address: "backbone.cardano.iog.io".into(),
                port: 3001,
            }],
            local_roots: vec![RootGroup {
                access_points: vec![AccessPoint {
                    address: "10.0.0.2".into(),
                    port: 3001,
                }],
                advertise: false,
            }],
            public_roots: vec![RootGroup {
                access_points: vec![
                    AccessPoint {
                        address: "relay1.example.com".into(),
                        port: 3001,
                    },
                    AccessPoint {
                        address: "relay2.example.com".into(),
                        port: 3001,
                    },
                ],
                advertise: true,
            }],
        };
        let peers = topology_peers(&topology);
        assert_eq!(peers.len(), 4);
        assert_eq!(peers[0].address, "backbone.cardano.iog.io:3001");
        assert!(!peers[0].sharable);
        assert!(!peers[1].sharable);
        assert!(peers[2].sharable);
        assert!(peers[3].sharable);
        assert!(peers.iter().all(|p| p.reconnect_delay.is_zero()));
    }
}
