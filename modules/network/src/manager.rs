//! Network manager: owns the shared state behind every listener and
//! dialer, routes body-fetch requests to the session that announced the
//! block, and fans shutdown out to every peer task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dingo_chain::ChainStore;
use dingo_common::messages::{Event, FetchRequest};
use dingo_common::topology::TopologyConfig;
use dingo_common::{ConnectionId, Point};
use dingo_connection_manager::ConnectionManager;
use dingo_event_bus::EventBus;
use dingo_mempool::Mempool;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::chainsync_state::ChainSyncState;
use crate::session::{PeerSession, SessionConfig};
use crate::{inbound, local, outbound};

#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub magic: u64,
    /// TCP listen address for inbound node-to-node sessions
    pub listen_address: Option<String>,
    /// UNIX socket path for node-to-client sessions
    pub socket_path: Option<PathBuf>,
    pub outbound_source_port: Option<u16>,
    /// Start a fresh sync from the upstream peer's tip
    pub intersect_tip: bool,
    /// Explicit start points used when the chain store is empty
    pub intersect_points: Vec<Point>,
}

/// State shared by the outbound workers and both listeners
pub struct NetworkShared {
    pub config: NetworkConfig,
    pub bus: Arc<EventBus<Event>>,
    pub chain: Arc<ChainStore>,
    pub mempool: Arc<Mempool>,
    pub connections: Arc<ConnectionManager>,
    pub chainsync_state: Arc<ChainSyncState>,
    pub shutdown: watch::Receiver<bool>,
    sessions: Mutex<HashMap<ConnectionId, Arc<PeerSession>>>,
}

impl NetworkShared {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            magic: self.config.magic,
            source_port: self.config.outbound_source_port,
        }
    }

    pub fn register_session(&self, session: Arc<PeerSession>) {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.insert(session.connection_id, session);
    }

    pub fn session(&self, id: ConnectionId) -> Option<Arc<PeerSession>> {
        let sessions = self.sessions.lock().expect("session table poisoned");
        sessions.get(&id).cloned()
    }

    /// Release everything a finished outbound session held: its command
    /// handle, the primary-client slot and its registry entry
    pub fn teardown_session(&self, id: ConnectionId, error: Option<String>) {
        {
            let mut sessions = self.sessions.lock().expect("session table poisoned");
            sessions.remove(&id);
        }
        self.chainsync_state.release_primary(id);
        self.connections.remove_connection(id, error);
    }
}

pub struct NetworkManager {
    shared: Arc<NetworkShared>,
    topology: TopologyConfig,
}

impl NetworkManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NetworkConfig,
        topology: TopologyConfig,
        bus: Arc<EventBus<Event>>,
        chain: Arc<ChainStore>,
        mempool: Arc<Mempool>,
        connections: Arc<ConnectionManager>,
        chainsync_state: Arc<ChainSyncState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let shared = Arc::new(NetworkShared {
            config,
            bus,
            chain,
            mempool,
            connections,
            chainsync_state,
            shutdown,
            sessions: Mutex::new(HashMap::new()),
        });
        Self { shared, topology }
    }

    /// Spawn the outbound workers, both listeners and the fetch router
    pub fn start(&self, fetch_requests: mpsc::Receiver<FetchRequest>) {
        outbound::start(self.shared.clone(), &self.topology);

        if let Some(address) = self.shared.config.listen_address.clone() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = inbound::run_listener(address, shared).await {
                    warn!("inbound listener stopped: {err:#}");
                }
            });
        }
        if let Some(path) = self.shared.config.socket_path.clone() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = local::run_listener(path, shared).await {
                    warn!("node-to-client listener stopped: {err:#}");
                }
            });
        }

        let shared = self.shared.clone();
        tokio::spawn(route_fetch_requests(shared, fetch_requests));
    }

    /// Close every live session; workers observe their connection's
    /// shutdown signal and drain
    pub fn stop(&self) {
        info!("stopping network");
        for conn in self.shared.connections.snapshot() {
            self.shared.connections.remove_connection(conn.id, None);
        }
    }
}

/// Forward chain-extension fetch requests to the announcing session
async fn route_fetch_requests(
    shared: Arc<NetworkShared>,
    mut requests: mpsc::Receiver<FetchRequest>,
) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            request = requests.recv() => {
                let Some(request) = request else { return };
                let Some(session) = shared.session(request.connection_id) else {
                    warn!(
                        connection_id = %request.connection_id,
                        slot = request.slot,
                        "block wanted from a session that is gone"
                    );
                    continue;
                };
                if session.request_block(request.hash, request.slot).is_err() {
                    warn!(
                        connection_id = %request.connection_id,
                        "could not request block, session is closing"
                    );
                }
            }
        }
    }
}
