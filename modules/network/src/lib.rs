//! Networking for the dingo node: the outbound peer manager, the inbound
//! and node-to-client listeners, and the handler logic behind every
//! mini-protocol surface. Wire framing and message codecs come from
//! pallas; the handlers here own the protocol semantics.

pub mod blockfetch;
pub mod chainsync;
pub mod chainsync_state;
pub mod inbound;
pub mod local;
pub mod manager;
pub mod outbound;
pub mod peersharing;
pub mod session;
pub mod txsubmission;

pub use chainsync_state::{ChainSyncClientState, ChainSyncState};
pub use manager::{NetworkConfig, NetworkManager};
