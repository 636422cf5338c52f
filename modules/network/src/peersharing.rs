//! PeerSharing server handler: advertise the sharable subset of our live
//! peers.

use std::net::SocketAddr;
use std::sync::Arc;

use dingo_connection_manager::ConnectionManager;
use pallas::network::miniprotocols::peersharing::PeerAddress;

pub struct PeerSharingHandler {
    connections: Arc<ConnectionManager>,
}

impl PeerSharingHandler {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Up to `amount` addresses of peers flagged as sharable
    pub fn sharable_addresses(&self, amount: u8) -> Vec<PeerAddress> {
        let mut addresses: Vec<PeerAddress> = self
            .connections
            .snapshot()
            .into_iter()
            .filter(|conn| conn.sharable)
            .filter_map(|conn| conn.address.parse::<SocketAddr>().ok())
            .map(|addr| match addr {
                SocketAddr::V4(v4) => PeerAddress::V4(*v4.ip(), v4.port().into()),
                SocketAddr::V6(v6) => PeerAddress::V6(*v6.ip(), v6.port().into()),
            })
            .collect();
        addresses.truncate(amount as usize);
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingo_common::Direction;
    use dingo_connection_manager::Connection;
    use dingo_event_bus::EventBus;

    #[test]
    fn only_sharable_peers_are_advertised_up_to_the_requested_amount() {
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(ConnectionManager::new(bus));
        for n in 0..4u8 {
            let id = manager.next_connection_id();
            manager
                .add_connection(Connection::new(
                    id,
                    format!("10.0.0.{n}:3001"),
                    Direction::Outbound,
                    n % 2 == 0,
                ))
                .unwrap();
        }
        // Hostnames that fail to parse as socket addresses are skipped
        let id = manager.next_connection_id();
        manager
            .add_connection(Connection::new(
                id,
                "relay.example.com:3001".into(),
                Direction::Outbound,
                true,
            ))
            .unwrap();

        let handler = PeerSharingHandler::new(manager);
        assert_eq!(handler.sharable_addresses(8).len(), 2);
        assert_eq!(handler.sharable_addresses(1).len(), 1);
    }
}
