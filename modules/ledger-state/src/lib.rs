//! Ledger-side state for the dingo node: the era registry with its
//! protocol-parameter machinery, rolling-nonce calculation, and the
//! chain-extension pipeline consuming chainsync/blockfetch events.

pub mod eras;
pub mod extension;
pub mod nonce;
pub mod pparams;

pub use eras::{era_desc, EraDesc, EraError};
pub use extension::ChainExtension;
pub use pparams::{ProtocolParameters, ProtocolParametersUpdate};
