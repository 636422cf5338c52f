//! Registry of live peer sessions.
//!
//! Owns one record per accepted or dialed connection, offers O(1) lookup
//! by id over a sharded map, and emits lifecycle events on the bus.
//! Connection ids are allocated from a process-wide counter and never
//! reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dingo_common::messages::{topics, ConnectionClosedEvent, Event, InboundConnectionEvent};
use dingo_common::{ConnectionId, Direction};
use dingo_event_bus::EventBus;
use tokio::sync::watch;
use tracing::{debug, warn};

const SHARD_COUNT: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionManagerError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

/// A live peer session. Dropping the record does not close the session;
/// [`ConnectionManager::remove_connection`] signals shutdown explicitly.
pub struct Connection {
    pub id: ConnectionId,
    pub address: String,
    pub direction: Direction,
    /// Whether this peer may be advertised through peer sharing
    pub sharable: bool,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    pub fn new(id: ConnectionId, address: String, direction: Direction, sharable: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            address,
            direction,
            sharable,
            shutdown,
        }
    }

    /// A receiver that flips to `true` when the session must stop
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

pub struct ConnectionManager {
    shards: Vec<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,
    next_id: AtomicU64,
    bus: Arc<EventBus<Event>>,
}

impl ConnectionManager {
    pub fn new(bus: Arc<EventBus<Event>>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            next_id: AtomicU64::new(0),
            bus,
        }
    }

    /// Allocate a fresh id for a session about to be established
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn shard(&self, id: ConnectionId) -> &RwLock<HashMap<ConnectionId, Arc<Connection>>> {
        &self.shards[(id.0 % SHARD_COUNT as u64) as usize]
    }

    /// Register a session; inbound registrations are announced on the bus
    pub fn add_connection(&self, conn: Connection) -> Result<Arc<Connection>, ConnectionManagerError> {
        let conn = Arc::new(conn);
        {
            let mut shard = self.shard(conn.id).write().expect("connection shard poisoned");
            if shard.contains_key(&conn.id) {
                return Err(ConnectionManagerError::DuplicateConnection(conn.id));
            }
            shard.insert(conn.id, conn.clone());
        }
        debug!(connection_id = %conn.id, address = %conn.address, direction = %conn.direction, "connection registered");
        if conn.direction == Direction::Inbound {
            self.bus.publish(
                topics::INBOUND_CONNECTION,
                Arc::new(Event::InboundConnection(InboundConnectionEvent {
                    connection_id: conn.id,
                    remote_address: conn.address.clone(),
                })),
            );
        }
        Ok(conn)
    }

    pub fn get_connection_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let shard = self.shard(id).read().expect("connection shard poisoned");
        shard.get(&id).cloned()
    }

    /// Deregister a session and announce its closure. Removing an unknown
    /// or already-removed id is a no-op.
    pub fn remove_connection(&self, id: ConnectionId, error: Option<String>) {
        let removed = {
            let mut shard = self.shard(id).write().expect("connection shard poisoned");
            shard.remove(&id)
        };
        let Some(conn) = removed else {
            return;
        };
        if let Some(error) = &error {
            warn!(connection_id = %id, address = %conn.address, error, "connection closed");
        } else {
            debug!(connection_id = %id, address = %conn.address, "connection closed");
        }
        let _ = conn.shutdown.send(true);
        self.bus.publish(
            topics::CONNECTION_CLOSED,
            Arc::new(Event::ConnectionClosed(ConnectionClosedEvent {
                connection_id: id,
                error,
            })),
        );
    }

    /// Non-blocking snapshot of every live session, for admin queries
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections = vec![];
        for shard in &self.shards {
            let shard = shard.read().expect("connection shard poisoned");
            connections.extend(shard.values().cloned());
        }
        connections.sort_by_key(|c| c.id);
        connections
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("connection shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_common::messages::Event;

    fn setup() -> (Arc<EventBus<Event>>, ConnectionManager) {
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::new(bus.clone());
        (bus, manager)
    }

    #[tokio::test]
    async fn add_then_remove_leaves_the_manager_empty_with_one_event_each() {
        let (bus, manager) = setup();
        let mut inbound = bus.subscribe(topics::INBOUND_CONNECTION);
        let mut closed = bus.subscribe(topics::CONNECTION_CLOSED);

        let id = manager.next_connection_id();
        let conn = Connection::new(id, "10.0.0.9:3001".into(), Direction::Inbound, false);
        manager.add_connection(conn).unwrap();
        assert_eq!(manager.len(), 1);

        manager.remove_connection(id, None);
        manager.remove_connection(id, None);
        assert!(manager.is_empty());

        match inbound.read().await.unwrap().as_ref() {
            Event::InboundConnection(event) => assert_eq!(event.connection_id, id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(inbound.try_read().is_none());
        match closed.read().await.unwrap().as_ref() {
            Event::ConnectionClosed(event) => {
                assert_eq!(event.connection_id, id);
                assert!(event.error.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(closed.try_read().is_none());
    }

    #[tokio::test]
    async fn outbound_connections_do_not_announce_inbound_events() {
        let (bus, manager) = setup();
        let mut inbound = bus.subscribe(topics::INBOUND_CONNECTION);
        let id = manager.next_connection_id();
        let conn = Connection::new(id, "10.0.0.9:3001".into(), Direction::Outbound, true);
        manager.add_connection(conn).unwrap();
        assert!(inbound.try_read().is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (_bus, manager) = setup();
        let id = manager.next_connection_id();
        let make = || Connection::new(id, "10.0.0.9:3001".into(), Direction::Outbound, false);
        manager.add_connection(make()).unwrap();
        assert!(matches!(
            manager.add_connection(make()),
            Err(ConnectionManagerError::DuplicateConnection(_))
        ));
    }

    #[test]
    fn removal_signals_session_shutdown() {
        let (_bus, manager) = setup();
        let id = manager.next_connection_id();
        let conn = manager
            .add_connection(Connection::new(
                id,
                "10.0.0.9:3001".into(),
                Direction::Outbound,
                false,
            ))
            .unwrap();
        let mut signal = conn.shutdown_signal();
        assert!(!*signal.borrow());
        manager.remove_connection(id, Some("read timeout".into()));
        assert!(*signal.borrow_and_update());
        assert!(conn.is_closed());
    }

    #[test]
    fn snapshot_lists_every_live_connection() {
        let (_bus, manager) = setup();
        let mut ids = vec![];
        for n in 0..20 {
            let id = manager.next_connection_id();
            ids.push(id);
            let direction = if n % 2 == 0 { Direction::Inbound } else { Direction::Outbound };
            manager
                .add_connection(Connection::new(id, format!("10.0.0.{n}:3001"), direction, false))
                .unwrap();
        }
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.iter().map(|c| c.id).collect::<Vec<_>>(), ids);
    }
}
