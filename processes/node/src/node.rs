use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dingo_chain::{ChainStore, StoreBuilder};
use dingo_common::genesis::CardanoNodeConfig;
use dingo_common::messages::Event;
use dingo_common::params::SECURITY_PARAMETER_K;
use dingo_common::topology::TopologyConfig;
use dingo_connection_manager::ConnectionManager;
use dingo_event_bus::EventBus;
use dingo_ledger_state::ChainExtension;
use dingo_mempool::{Mempool, MempoolConfig};
use dingo_network::{ChainSyncState, NetworkConfig, NetworkManager};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::configuration::NodeConfig;

const FETCH_QUEUE_SIZE: usize = 256;
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub struct Node {
    chain: Arc<ChainStore>,
    network: NetworkManager,
    extension: JoinHandle<Result<()>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Wire every subsystem together. Configuration problems (bad
    /// genesis, bad topology, unknown store backend) are fatal here.
    pub fn build(config: NodeConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::<Event>::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let topology = TopologyConfig::load(&config.topology)?;

        let mut node_config = CardanoNodeConfig::new(
            config.network_magic,
            config.shelley_genesis_hash.clone().unwrap_or_default(),
        );
        if let Some(path) = &config.byron_genesis {
            node_config.load_byron_genesis(path)?;
        }
        if let Some(path) = &config.shelley_genesis {
            node_config.load_shelley_genesis(path)?;
        }
        if let Some(path) = &config.alonzo_genesis {
            node_config.load_alonzo_genesis(path)?;
        }
        if let Some(path) = &config.conway_genesis {
            node_config.load_conway_genesis(path)?;
        }

        let store = StoreBuilder::new(&config.store)
            .path(config.data_dir.join("chain"))
            .build()
            .context("could not open block store")?;
        let security_param = if config.security_param == 0 {
            SECURITY_PARAMETER_K
        } else {
            config.security_param
        };
        let chain = Arc::new(ChainStore::new(store, security_param, bus.clone())?);
        info!(tip = %chain.tip().point, "chain store open");

        let mempool = Arc::new(Mempool::new(MempoolConfig::default(), bus.clone()));
        let connections = Arc::new(ConnectionManager::new(bus.clone()));
        let chainsync_state = Arc::new(ChainSyncState::new());

        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE_SIZE);
        let extension = ChainExtension::new(
            chain.clone(),
            bus.clone(),
            mempool.clone(),
            connections.clone(),
            Arc::new(node_config),
            fetch_tx,
        );
        let extension = tokio::spawn(extension.run(shutdown_rx.clone()));

        let network_config = NetworkConfig {
            magic: config.network_magic as u64,
            listen_address: config.listen_address.clone(),
            socket_path: config.socket_path.clone(),
            outbound_source_port: config.outbound_source_port,
            intersect_tip: config.intersect_tip,
            intersect_points: config.parse_intersect_points()?,
        };
        let network = NetworkManager::new(
            network_config,
            topology,
            bus,
            chain.clone(),
            mempool,
            connections,
            chainsync_state,
            shutdown_rx,
        );
        network.start(fetch_rx);

        Ok(Self {
            chain,
            network,
            extension,
            shutdown,
        })
    }

    /// Run until interrupted or a core subsystem dies
    pub async fn run(mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
            result = &mut self.extension => {
                match result {
                    Ok(Ok(())) => warn!("chain extension stopped"),
                    Ok(Err(err)) => error!("chain extension failed: {err:#}"),
                    Err(err) => error!("chain extension panicked: {err}"),
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Signal every subsystem and allow a bounded drain
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.network.stop();
        self.chain.close();
        if !self.extension.is_finished() {
            if tokio::time::timeout(SHUTDOWN_DRAIN, self.extension).await.is_err() {
                warn!("chain extension did not drain in time, dropping");
            }
        }
        info!("shutdown complete");
    }
}
