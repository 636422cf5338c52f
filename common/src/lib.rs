// Dingo common library - shared types and constants

pub mod genesis;
pub mod genesis_values;
pub mod hash;
pub mod messages;
pub mod params;
pub mod topology;
pub mod types;

// Flattened re-exports
pub use self::hash::{BlockHash, Hash, TxHash};
pub use self::types::*;
