//! Rolling VRF nonce (eta-v) evolution

use dingo_common::genesis::CardanoNodeConfig;
use pallas::crypto::hash::Hasher;

use crate::eras::EraError;

/// Combine the previous nonce with a block's nonce contribution via the
/// rolling blake2b-256 hash
pub fn rolling_nonce(prev: &[u8], block_nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::<256>::new();
    hasher.input(prev);
    hasher.input(block_nonce);
    hasher.finalize().to_vec()
}

/// Evolve eta-v with a block's nonce contribution. An empty previous nonce
/// is seeded from the configured Shelley genesis hash.
pub fn evolve_eta_v(
    config: &CardanoNodeConfig,
    prev: &[u8],
    block_nonce: &[u8],
) -> Result<Vec<u8>, EraError> {
    let seeded;
    let prev = if prev.is_empty() {
        seeded = hex::decode(&config.shelley_genesis_hash)
            .map_err(|e| EraError::Config(format!("bad Shelley genesis hash: {e}")))?;
        &seeded
    } else {
        prev
    };
    Ok(rolling_nonce(prev, block_nonce))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS_HASH: &str = "1a3be38bcbb7911969283716ad7aa550250226b76a61fc51cc9a9a35d9276d81";

    fn test_config() -> CardanoNodeConfig {
        CardanoNodeConfig::new(764824073, GENESIS_HASH.to_string())
    }

    #[test]
    fn empty_previous_nonce_seeds_from_the_genesis_hash() {
        let config = test_config();
        let vrf_nonce = [7u8; 32];
        let from_empty = evolve_eta_v(&config, &[], &vrf_nonce).unwrap();
        let from_seed =
            evolve_eta_v(&config, &hex::decode(GENESIS_HASH).unwrap(), &vrf_nonce).unwrap();
        assert_eq!(from_empty, from_seed);
        assert_eq!(from_empty.len(), 32);
    }

    #[test]
    fn evolution_depends_on_both_inputs() {
        let config = test_config();
        let a = evolve_eta_v(&config, &[1u8; 32], &[2u8; 32]).unwrap();
        let b = evolve_eta_v(&config, &[1u8; 32], &[3u8; 32]).unwrap();
        let c = evolve_eta_v(&config, &[4u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn malformed_genesis_hash_is_a_config_error() {
        let config = CardanoNodeConfig::new(2, "not-hex".to_string());
        assert!(matches!(
            evolve_eta_v(&config, &[], &[0u8; 32]),
            Err(EraError::Config(_))
        ));
    }
}
