//! Era-specific protocol parameters.
//!
//! Each era carries its own parameter record. Updates arrive on the wire
//! as era-specific CBOR and are decoded through the pallas primitives;
//! hard forks carry the previous era's record forward, applying genesis
//! tweaks where an era introduces new parameters.

use dingo_common::genesis::{
    AlonzoGenesis, ConwayGenesis, ShelleyGenesisProtocolParams,
};
use dingo_common::Era;
use pallas::ledger::primitives::{alonzo, babbage, conway};
use pallas::ledger::primitives::conway::RationalNumber as PallasRational;

/// An exact fraction, kept as numerator/denominator
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Rational {
    #[n(0)]
    pub numerator: u64,
    #[n(1)]
    pub denominator: u64,
}

impl Rational {
    pub const ZERO: Rational = Rational {
        numerator: 0,
        denominator: 1,
    };

    pub fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Exact enough for genesis fractions, which are short decimals
    pub fn from_f64(value: f64) -> Self {
        const SCALE: u64 = 1_000_000_000;
        let numerator = (value * SCALE as f64).round() as u64;
        let divisor = gcd(numerator, SCALE);
        Self {
            numerator: numerator / divisor,
            denominator: SCALE / divisor,
        }
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a.max(1)
    } else {
        gcd(b, a % b)
    }
}

impl From<&PallasRational> for Rational {
    fn from(r: &PallasRational) -> Self {
        Self {
            numerator: r.numerator,
            denominator: r.denominator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ProtocolVersion {
    #[n(0)]
    pub major: u64,
    #[n(1)]
    pub minor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ExUnits {
    #[n(0)]
    pub mem: u64,
    #[n(1)]
    pub steps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ExUnitPrices {
    #[n(0)]
    pub mem_price: Rational,
    #[n(1)]
    pub step_price: Rational,
}

/// Parameters shared by Shelley, Allegra and Mary
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ShelleyParams {
    #[n(0)]
    pub minfee_a: u64,
    #[n(1)]
    pub minfee_b: u64,
    #[n(2)]
    pub max_block_body_size: u64,
    #[n(3)]
    pub max_tx_size: u64,
    #[n(4)]
    pub max_block_header_size: u64,
    #[n(5)]
    pub key_deposit: u64,
    #[n(6)]
    pub pool_deposit: u64,
    #[n(7)]
    pub pool_retire_max_epoch: u64,
    #[n(8)]
    pub stake_pool_target_num: u64,
    #[n(9)]
    pub pool_pledge_influence: Rational,
    #[n(10)]
    pub monetary_expansion: Rational,
    #[n(11)]
    pub treasury_cut: Rational,
    #[n(12)]
    pub decentralisation: Rational,
    #[n(13)]
    pub extra_entropy: Option<Vec<u8>>,
    #[n(14)]
    pub protocol_version: ProtocolVersion,
    #[n(15)]
    pub min_utxo_value: u64,
    #[n(16)]
    pub min_pool_cost: u64,
}

impl ShelleyParams {
    pub fn from_genesis(genesis: &ShelleyGenesisProtocolParams) -> Self {
        Self {
            minfee_a: genesis.min_fee_a,
            minfee_b: genesis.min_fee_b,
            max_block_body_size: genesis.max_block_body_size,
            max_tx_size: genesis.max_tx_size,
            max_block_header_size: genesis.max_block_header_size,
            key_deposit: genesis.key_deposit,
            pool_deposit: genesis.pool_deposit,
            pool_retire_max_epoch: genesis.pool_retire_max_epoch,
            stake_pool_target_num: genesis.stake_pool_target_num,
            pool_pledge_influence: Rational::from_f64(genesis.pool_pledge_influence),
            monetary_expansion: Rational::from_f64(genesis.monetary_expansion),
            treasury_cut: Rational::from_f64(genesis.treasury_cut),
            decentralisation: Rational::from_f64(genesis.decentralisation_param),
            extra_entropy: None,
            protocol_version: ProtocolVersion {
                major: genesis.protocol_version.major,
                minor: genesis.protocol_version.minor,
            },
            min_utxo_value: genesis.min_utxo_value,
            min_pool_cost: genesis.min_pool_cost,
        }
    }

    pub fn apply_update(&mut self, u: &alonzo::ProtocolParamUpdate) {
        if let Some(v) = u.minfee_a {
            self.minfee_a = v as u64;
        }
        if let Some(v) = u.minfee_b {
            self.minfee_b = v as u64;
        }
        if let Some(v) = u.max_block_body_size {
            self.max_block_body_size = v as u64;
        }
        if let Some(v) = u.max_transaction_size {
            self.max_tx_size = v as u64;
        }
        if let Some(v) = u.max_block_header_size {
            self.max_block_header_size = v as u64;
        }
        if let Some(v) = u.key_deposit {
            self.key_deposit = v;
        }
        if let Some(v) = u.pool_deposit {
            self.pool_deposit = v;
        }
        if let Some(v) = u.maximum_epoch {
            self.pool_retire_max_epoch = v;
        }
        if let Some(v) = u.desired_number_of_stake_pools {
            self.stake_pool_target_num = v as u64;
        }
        if let Some(v) = &u.pool_pledge_influence {
            self.pool_pledge_influence = v.into();
        }
        if let Some(v) = &u.expansion_rate {
            self.monetary_expansion = v.into();
        }
        if let Some(v) = &u.treasury_growth_rate {
            self.treasury_cut = v.into();
        }
        if let Some(v) = &u.decentralization_constant {
            self.decentralisation = v.into();
        }
        if let Some(v) = u.protocol_version {
            self.protocol_version = ProtocolVersion {
                major: v.0,
                minor: v.1,
            };
        }
        if let Some(v) = u.min_utxo_value {
            self.min_utxo_value = v;
        }
        if let Some(v) = u.min_pool_cost {
            self.min_pool_cost = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AlonzoParams {
    #[n(0)]
    pub shelley: ShelleyParams,
    #[n(1)]
    pub lovelace_per_utxo_word: u64,
    #[n(2)]
    pub execution_prices: ExUnitPrices,
    #[n(3)]
    pub max_tx_ex_units: ExUnits,
    #[n(4)]
    pub max_block_ex_units: ExUnits,
    #[n(5)]
    pub max_value_size: u64,
    #[n(6)]
    pub collateral_percentage: u64,
    #[n(7)]
    pub max_collateral_inputs: u64,
}

impl AlonzoParams {
    /// Hard fork from Mary, applying the Alonzo genesis additions
    pub fn upgrade(prev: ShelleyParams, genesis: &AlonzoGenesis) -> Self {
        Self {
            shelley: prev,
            lovelace_per_utxo_word: genesis.lovelace_per_utxo_word,
            execution_prices: ExUnitPrices {
                mem_price: Rational::from_f64(genesis.execution_prices.pr_mem),
                step_price: Rational::from_f64(genesis.execution_prices.pr_steps),
            },
            max_tx_ex_units: ExUnits {
                mem: genesis.max_tx_ex_units.ex_units_mem,
                steps: genesis.max_tx_ex_units.ex_units_steps,
            },
            max_block_ex_units: ExUnits {
                mem: genesis.max_block_ex_units.ex_units_mem,
                steps: genesis.max_block_ex_units.ex_units_steps,
            },
            max_value_size: genesis.max_value_size,
            collateral_percentage: genesis.collateral_percentage,
            max_collateral_inputs: genesis.max_collateral_inputs,
        }
    }

    pub fn apply_update(&mut self, u: &alonzo::ProtocolParamUpdate) {
        self.shelley.apply_update(u);
        if let Some(v) = u.ada_per_utxo_byte {
            self.lovelace_per_utxo_word = v;
        }
        if let Some(v) = &u.execution_costs {
            self.execution_prices = ExUnitPrices {
                mem_price: (&v.mem_price).into(),
                step_price: (&v.step_price).into(),
            };
        }
        if let Some(v) = &u.max_tx_ex_units {
            self.max_tx_ex_units = ExUnits {
                mem: v.mem as u64,
                steps: v.steps,
            };
        }
        if let Some(v) = &u.max_block_ex_units {
            self.max_block_ex_units = ExUnits {
                mem: v.mem as u64,
                steps: v.steps,
            };
        }
        if let Some(v) = u.max_value_size {
            self.max_value_size = v as u64;
        }
        if let Some(v) = u.collateral_percentage {
            self.collateral_percentage = v as u64;
        }
        if let Some(v) = u.max_collateral_inputs {
            self.max_collateral_inputs = v as u64;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct BabbageParams {
    #[n(0)]
    pub alonzo: AlonzoParams,
    #[n(1)]
    pub coins_per_utxo_byte: u64,
}

impl BabbageParams {
    /// Hard fork from Alonzo; the per-word deposit becomes per-byte
    pub fn upgrade(prev: AlonzoParams) -> Self {
        let coins_per_utxo_byte = prev.lovelace_per_utxo_word / 8;
        Self {
            alonzo: prev,
            coins_per_utxo_byte,
        }
    }

    pub fn apply_update(&mut self, u: &babbage::ProtocolParamUpdate) {
        if let Some(v) = u.minfee_a {
            self.alonzo.shelley.minfee_a = v as u64;
        }
        if let Some(v) = u.minfee_b {
            self.alonzo.shelley.minfee_b = v as u64;
        }
        if let Some(v) = u.max_block_body_size {
            self.alonzo.shelley.max_block_body_size = v as u64;
        }
        if let Some(v) = u.max_transaction_size {
            self.alonzo.shelley.max_tx_size = v as u64;
        }
        if let Some(v) = u.max_block_header_size {
            self.alonzo.shelley.max_block_header_size = v as u64;
        }
        if let Some(v) = u.key_deposit {
            self.alonzo.shelley.key_deposit = v;
        }
        if let Some(v) = u.pool_deposit {
            self.alonzo.shelley.pool_deposit = v;
        }
        if let Some(v) = u.maximum_epoch {
            self.alonzo.shelley.pool_retire_max_epoch = v;
        }
        if let Some(v) = u.desired_number_of_stake_pools {
            self.alonzo.shelley.stake_pool_target_num = v as u64;
        }
        if let Some(v) = &u.pool_pledge_influence {
            self.alonzo.shelley.pool_pledge_influence = v.into();
        }
        if let Some(v) = &u.expansion_rate {
            self.alonzo.shelley.monetary_expansion = v.into();
        }
        if let Some(v) = &u.treasury_growth_rate {
            self.alonzo.shelley.treasury_cut = v.into();
        }
        if let Some(v) = u.protocol_version {
            self.alonzo.shelley.protocol_version = ProtocolVersion {
                major: v.0,
                minor: v.1,
            };
        }
        if let Some(v) = u.min_pool_cost {
            self.alonzo.shelley.min_pool_cost = v;
        }
        if let Some(v) = u.ada_per_utxo_byte {
            self.coins_per_utxo_byte = v;
        }
        if let Some(v) = &u.execution_costs {
            self.alonzo.execution_prices = ExUnitPrices {
                mem_price: (&v.mem_price).into(),
                step_price: (&v.step_price).into(),
            };
        }
        if let Some(v) = &u.max_tx_ex_units {
            self.alonzo.max_tx_ex_units = ExUnits {
                mem: v.mem as u64,
                steps: v.steps,
            };
        }
        if let Some(v) = &u.max_block_ex_units {
            self.alonzo.max_block_ex_units = ExUnits {
                mem: v.mem as u64,
                steps: v.steps,
            };
        }
        if let Some(v) = u.max_value_size {
            self.alonzo.max_value_size = v as u64;
        }
        if let Some(v) = u.collateral_percentage {
            self.alonzo.collateral_percentage = v as u64;
        }
        if let Some(v) = u.max_collateral_inputs {
            self.alonzo.max_collateral_inputs = v as u64;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ConwayParams {
    #[n(0)]
    pub babbage: BabbageParams,
    #[n(1)]
    pub committee_min_size: u64,
    #[n(2)]
    pub committee_max_term_length: u64,
    #[n(3)]
    pub gov_action_lifetime: u64,
    #[n(4)]
    pub gov_action_deposit: u64,
    #[n(5)]
    pub drep_deposit: u64,
    #[n(6)]
    pub drep_activity: u64,
    #[n(7)]
    pub min_fee_ref_script_cost_per_byte: Rational,
}

impl ConwayParams {
    /// Hard fork from Babbage, applying the Conway genesis governance
    /// parameters
    pub fn upgrade(prev: BabbageParams, genesis: &ConwayGenesis) -> Self {
        Self {
            babbage: prev,
            committee_min_size: genesis.committee_min_size,
            committee_max_term_length: genesis.committee_max_term_length,
            gov_action_lifetime: genesis.gov_action_lifetime,
            gov_action_deposit: genesis.gov_action_deposit,
            drep_deposit: genesis.drep_deposit,
            drep_activity: genesis.drep_activity,
            min_fee_ref_script_cost_per_byte: Rational::from_f64(
                genesis.min_fee_ref_script_cost_per_byte,
            ),
        }
    }

    pub fn apply_update(&mut self, u: &conway::ProtocolParamUpdate) {
        let shelley = &mut self.babbage.alonzo.shelley;
        if let Some(v) = u.minfee_a {
            shelley.minfee_a = v as u64;
        }
        if let Some(v) = u.minfee_b {
            shelley.minfee_b = v as u64;
        }
        if let Some(v) = u.max_block_body_size {
            shelley.max_block_body_size = v as u64;
        }
        if let Some(v) = u.max_transaction_size {
            shelley.max_tx_size = v as u64;
        }
        if let Some(v) = u.max_block_header_size {
            shelley.max_block_header_size = v as u64;
        }
        if let Some(v) = u.key_deposit {
            shelley.key_deposit = v as u64;
        }
        if let Some(v) = u.pool_deposit {
            shelley.pool_deposit = v as u64;
        }
        if let Some(v) = u.maximum_epoch {
            shelley.pool_retire_max_epoch = v as u64;
        }
        if let Some(v) = u.desired_number_of_stake_pools {
            shelley.stake_pool_target_num = v as u64;
        }
        if let Some(v) = &u.pool_pledge_influence {
            shelley.pool_pledge_influence = v.into();
        }
        if let Some(v) = &u.expansion_rate {
            shelley.monetary_expansion = v.into();
        }
        if let Some(v) = &u.treasury_growth_rate {
            shelley.treasury_cut = v.into();
        }
        if let Some(v) = u.min_pool_cost {
            shelley.min_pool_cost = v as u64;
        }
        if let Some(v) = u.ada_per_utxo_byte {
            self.babbage.coins_per_utxo_byte = v as u64;
        }
        if let Some(v) = &u.execution_costs {
            self.babbage.alonzo.execution_prices = ExUnitPrices {
                mem_price: (&v.mem_price).into(),
                step_price: (&v.step_price).into(),
            };
        }
        if let Some(v) = &u.max_tx_ex_units {
            self.babbage.alonzo.max_tx_ex_units = ExUnits {
                mem: v.mem as u64,
                steps: v.steps,
            };
        }
        if let Some(v) = &u.max_block_ex_units {
            self.babbage.alonzo.max_block_ex_units = ExUnits {
                mem: v.mem as u64,
                steps: v.steps,
            };
        }
        if let Some(v) = u.max_value_size {
            self.babbage.alonzo.max_value_size = v as u64;
        }
        if let Some(v) = u.collateral_percentage {
            self.babbage.alonzo.collateral_percentage = v as u64;
        }
        if let Some(v) = u.max_collateral_inputs {
            self.babbage.alonzo.max_collateral_inputs = v as u64;
        }
        if let Some(v) = u.min_committee_size {
            self.committee_min_size = v as u64;
        }
        if let Some(v) = u.committee_term_limit {
            self.committee_max_term_length = v as u64;
        }
        if let Some(v) = u.governance_action_validity_period {
            self.gov_action_lifetime = v as u64;
        }
        if let Some(v) = u.governance_action_deposit {
            self.gov_action_deposit = v as u64;
        }
        if let Some(v) = u.drep_deposit {
            self.drep_deposit = v as u64;
        }
        if let Some(v) = u.drep_inactivity_period {
            self.drep_activity = v as u64;
        }
        if let Some(v) = &u.minfee_refscript_cost_per_byte {
            self.min_fee_ref_script_cost_per_byte = v.into();
        }
    }
}

/// The node's current protocol parameters, tagged by era
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ProtocolParameters {
    #[n(1)]
    Shelley(#[n(0)] ShelleyParams),
    #[n(2)]
    Allegra(#[n(0)] ShelleyParams),
    #[n(3)]
    Mary(#[n(0)] ShelleyParams),
    #[n(4)]
    Alonzo(#[n(0)] AlonzoParams),
    #[n(5)]
    Babbage(#[n(0)] BabbageParams),
    #[n(6)]
    Conway(#[n(0)] ConwayParams),
}

impl ProtocolParameters {
    pub fn era(&self) -> Era {
        match self {
            ProtocolParameters::Shelley(_) => Era::Shelley,
            ProtocolParameters::Allegra(_) => Era::Allegra,
            ProtocolParameters::Mary(_) => Era::Mary,
            ProtocolParameters::Alonzo(_) => Era::Alonzo,
            ProtocolParameters::Babbage(_) => Era::Babbage,
            ProtocolParameters::Conway(_) => Era::Conway,
        }
    }
}

/// A decoded on-chain parameter update, tagged by the era that encoded it
#[derive(Debug, Clone)]
pub enum ProtocolParametersUpdate {
    /// Shelley through Alonzo share a wire format
    Alonzo(alonzo::ProtocolParamUpdate),
    Babbage(babbage::ProtocolParamUpdate),
    Conway(conway::ProtocolParamUpdate),
}

impl ProtocolParametersUpdate {
    /// The newest era using this wire format
    pub fn era(&self) -> Era {
        match self {
            ProtocolParametersUpdate::Alonzo(_) => Era::Alonzo,
            ProtocolParametersUpdate::Babbage(_) => Era::Babbage,
            ProtocolParametersUpdate::Conway(_) => Era::Conway,
        }
    }
}
