//! Era genesis documents and the node configuration that carries them

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Byron genesis numbers arrive as JSON strings
fn number_from_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        String(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByronProtocolConsts {
    pub k: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByronBlockVersionData {
    /// Slot duration in milliseconds
    #[serde(deserialize_with = "number_from_string")]
    pub slot_duration: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByronGenesis {
    pub protocol_consts: ByronProtocolConsts,
    pub block_version_data: ByronBlockVersionData,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelleyGenesisProtocolVersion {
    pub major: u64,
    pub minor: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelleyGenesisProtocolParams {
    pub protocol_version: ShelleyGenesisProtocolVersion,
    pub max_tx_size: u64,
    pub max_block_body_size: u64,
    pub max_block_header_size: u64,
    #[serde(rename = "minFeeA")]
    pub min_fee_a: u64,
    #[serde(rename = "minFeeB")]
    pub min_fee_b: u64,
    pub key_deposit: u64,
    pub pool_deposit: u64,
    #[serde(rename = "eMax")]
    pub pool_retire_max_epoch: u64,
    #[serde(rename = "nOpt")]
    pub stake_pool_target_num: u64,
    pub min_pool_cost: u64,
    #[serde(rename = "minUTxOValue")]
    pub min_utxo_value: u64,
    #[serde(rename = "a0")]
    pub pool_pledge_influence: f64,
    #[serde(rename = "rho")]
    pub monetary_expansion: f64,
    #[serde(rename = "tau")]
    pub treasury_cut: f64,
    pub decentralisation_param: f64,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelleyGenesis {
    pub network_magic: u32,
    pub security_param: u64,
    pub epoch_length: u64,
    /// Slot length in seconds
    pub slot_length: u64,
    pub active_slots_coeff: f64,
    pub protocol_params: ShelleyGenesisProtocolParams,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlonzoExUnits {
    pub ex_units_mem: u64,
    pub ex_units_steps: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlonzoExUnitPrices {
    pub pr_mem: f64,
    pub pr_steps: f64,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlonzoGenesis {
    #[serde(rename = "lovelacePerUTxOWord")]
    pub lovelace_per_utxo_word: u64,
    pub execution_prices: AlonzoExUnitPrices,
    pub max_tx_ex_units: AlonzoExUnits,
    pub max_block_ex_units: AlonzoExUnits,
    pub max_value_size: u64,
    pub collateral_percentage: u64,
    pub max_collateral_inputs: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConwayGenesis {
    pub committee_min_size: u64,
    pub committee_max_term_length: u64,
    pub gov_action_lifetime: u64,
    pub gov_action_deposit: u64,
    #[serde(rename = "dRepDeposit")]
    pub drep_deposit: u64,
    #[serde(rename = "dRepActivity")]
    pub drep_activity: u64,
    pub min_fee_ref_script_cost_per_byte: f64,
}

fn load_genesis<T: serde::de::DeserializeOwned>(path: &Path, era: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {era} genesis file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("could not parse {era} genesis file {}", path.display()))
}

/// Node configuration shared by the era registry and the network layer
#[derive(Debug, Clone, Default)]
pub struct CardanoNodeConfig {
    pub network_magic: u32,
    pub shelley_genesis_hash: String,
    byron_genesis: Option<ByronGenesis>,
    shelley_genesis: Option<ShelleyGenesis>,
    alonzo_genesis: Option<AlonzoGenesis>,
    conway_genesis: Option<ConwayGenesis>,
}

impl CardanoNodeConfig {
    pub fn new(network_magic: u32, shelley_genesis_hash: String) -> Self {
        Self {
            network_magic,
            shelley_genesis_hash,
            ..Default::default()
        }
    }

    pub fn load_byron_genesis(&mut self, path: &PathBuf) -> Result<()> {
        self.byron_genesis = Some(load_genesis(path, "Byron")?);
        Ok(())
    }

    pub fn load_shelley_genesis(&mut self, path: &PathBuf) -> Result<()> {
        self.shelley_genesis = Some(load_genesis(path, "Shelley")?);
        Ok(())
    }

    pub fn load_alonzo_genesis(&mut self, path: &PathBuf) -> Result<()> {
        self.alonzo_genesis = Some(load_genesis(path, "Alonzo")?);
        Ok(())
    }

    pub fn load_conway_genesis(&mut self, path: &PathBuf) -> Result<()> {
        self.conway_genesis = Some(load_genesis(path, "Conway")?);
        Ok(())
    }

    pub fn set_byron_genesis(&mut self, genesis: ByronGenesis) {
        self.byron_genesis = Some(genesis);
    }

    pub fn set_shelley_genesis(&mut self, genesis: ShelleyGenesis) {
        self.shelley_genesis = Some(genesis);
    }

    pub fn set_alonzo_genesis(&mut self, genesis: AlonzoGenesis) {
        self.alonzo_genesis = Some(genesis);
    }

    pub fn set_conway_genesis(&mut self, genesis: ConwayGenesis) {
        self.conway_genesis = Some(genesis);
    }

    pub fn byron_genesis(&self) -> Result<&ByronGenesis> {
        self.byron_genesis.as_ref().context("Byron genesis not loaded")
    }

    pub fn shelley_genesis(&self) -> Result<&ShelleyGenesis> {
        self.shelley_genesis.as_ref().context("Shelley genesis not loaded")
    }

    pub fn alonzo_genesis(&self) -> Result<&AlonzoGenesis> {
        self.alonzo_genesis.as_ref().context("Alonzo genesis not loaded")
    }

    pub fn conway_genesis(&self) -> Result<&ConwayGenesis> {
        self.conway_genesis.as_ref().context("Conway genesis not loaded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_byron_genesis_with_string_numbers() {
        let raw = r#"{
            "protocolConsts": { "k": 2160 },
            "blockVersionData": { "slotDuration": "20000" }
        }"#;
        let genesis: ByronGenesis = serde_json::from_str(raw).unwrap();
        assert_eq!(genesis.protocol_consts.k, 2160);
        assert_eq!(genesis.block_version_data.slot_duration, 20000);
    }

    #[test]
    fn missing_genesis_is_an_error() {
        let config = CardanoNodeConfig::new(2, String::new());
        assert!(config.byron_genesis().is_err());
        assert!(config.shelley_genesis().is_err());
    }
}
