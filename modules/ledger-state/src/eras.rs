//! The era registry: one descriptor per era, indexed by era tag.
//!
//! Descriptors bundle the pure functions that differ between eras: epoch
//! geometry, protocol-parameter codecs and updates, hard-fork upgrades and
//! nonce calculation. Byron supports none of the parameter machinery, so
//! those entries are absent rather than stubbed.

use dingo_common::genesis::CardanoNodeConfig;
use dingo_common::{BlockHeader, Era};
use pallas::crypto::hash::Hasher;
use pallas::ledger::primitives::{alonzo, babbage, conway};
use pallas::ledger::traverse::MultiEraHeader;

use crate::nonce::evolve_eta_v;
use crate::pparams::{
    AlonzoParams, BabbageParams, ConwayParams, ProtocolParameters, ProtocolParametersUpdate,
    ShelleyParams,
};

#[derive(Debug, thiserror::Error)]
pub enum EraError {
    #[error("{era} does not support {operation}")]
    Unsupported { era: Era, operation: &'static str },
    #[error("expected {expected} parameters, got {got}")]
    WrongEraType { expected: Era, got: Era },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("header error: {0}")]
    Header(String),
}

/// Slot geometry of an era
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochLength {
    pub slot_duration_ms: u64,
    pub epoch_slots: u64,
}

type EpochLengthFn = fn(&CardanoNodeConfig) -> Result<EpochLength, EraError>;
type DecodePParamsFn = fn(&[u8]) -> Result<ProtocolParameters, EraError>;
type DecodePParamsUpdateFn = fn(&[u8]) -> Result<ProtocolParametersUpdate, EraError>;
type PParamsUpdateFn =
    fn(&ProtocolParameters, &ProtocolParametersUpdate) -> Result<ProtocolParameters, EraError>;
type HardForkFn =
    fn(&CardanoNodeConfig, Option<&ProtocolParameters>) -> Result<ProtocolParameters, EraError>;
type CalculateEtaVFn =
    fn(&CardanoNodeConfig, &[u8], &BlockHeader) -> Result<Vec<u8>, EraError>;

pub struct EraDesc {
    pub id: u8,
    pub name: &'static str,
    pub epoch_length: EpochLengthFn,
    pub decode_pparams: Option<DecodePParamsFn>,
    pub decode_pparams_update: Option<DecodePParamsUpdateFn>,
    pub pparams_update: Option<PParamsUpdateFn>,
    pub hard_fork: Option<HardForkFn>,
    pub calculate_eta_v: Option<CalculateEtaVFn>,
}

pub static ERAS: [EraDesc; 7] = [
    EraDesc {
        id: 0,
        name: "Byron",
        epoch_length: epoch_length_byron,
        decode_pparams: None,
        decode_pparams_update: None,
        pparams_update: None,
        hard_fork: None,
        calculate_eta_v: None,
    },
    EraDesc {
        id: 1,
        name: "Shelley",
        epoch_length: epoch_length_shelley,
        decode_pparams: Some(decode_pparams_shelley),
        decode_pparams_update: Some(decode_pparams_update_pre_babbage),
        pparams_update: Some(pparams_update_shelley),
        hard_fork: Some(hard_fork_shelley),
        calculate_eta_v: Some(calculate_eta_v_tpraos),
    },
    EraDesc {
        id: 2,
        name: "Allegra",
        epoch_length: epoch_length_shelley,
        decode_pparams: Some(decode_pparams_allegra),
        decode_pparams_update: Some(decode_pparams_update_pre_babbage),
        pparams_update: Some(pparams_update_allegra),
        hard_fork: Some(hard_fork_allegra),
        calculate_eta_v: Some(calculate_eta_v_tpraos),
    },
    EraDesc {
        id: 3,
        name: "Mary",
        epoch_length: epoch_length_shelley,
        decode_pparams: Some(decode_pparams_mary),
        decode_pparams_update: Some(decode_pparams_update_pre_babbage),
        pparams_update: Some(pparams_update_mary),
        hard_fork: Some(hard_fork_mary),
        calculate_eta_v: Some(calculate_eta_v_tpraos),
    },
    EraDesc {
        id: 4,
        name: "Alonzo",
        epoch_length: epoch_length_shelley,
        decode_pparams: Some(decode_pparams_alonzo),
        decode_pparams_update: Some(decode_pparams_update_pre_babbage),
        pparams_update: Some(pparams_update_alonzo),
        hard_fork: Some(hard_fork_alonzo),
        calculate_eta_v: Some(calculate_eta_v_tpraos),
    },
    EraDesc {
        id: 5,
        name: "Babbage",
        epoch_length: epoch_length_shelley,
        decode_pparams: Some(decode_pparams_babbage),
        decode_pparams_update: Some(decode_pparams_update_babbage),
        pparams_update: Some(pparams_update_babbage),
        hard_fork: Some(hard_fork_babbage),
        calculate_eta_v: Some(calculate_eta_v_praos),
    },
    EraDesc {
        id: 6,
        name: "Conway",
        epoch_length: epoch_length_shelley,
        decode_pparams: Some(decode_pparams_conway),
        decode_pparams_update: Some(decode_pparams_update_conway),
        pparams_update: Some(pparams_update_conway),
        hard_fork: Some(hard_fork_conway),
        calculate_eta_v: Some(calculate_eta_v_praos),
    },
];

/// Descriptor lookup by era tag
pub fn era_desc(era: Era) -> &'static EraDesc {
    &ERAS[u8::from(era) as usize]
}

// -- Epoch geometry --

fn epoch_length_byron(config: &CardanoNodeConfig) -> Result<EpochLength, EraError> {
    let genesis = config.byron_genesis().map_err(|e| EraError::Config(e.to_string()))?;
    Ok(EpochLength {
        slot_duration_ms: genesis.block_version_data.slot_duration,
        epoch_slots: genesis.protocol_consts.k * 10,
    })
}

fn epoch_length_shelley(config: &CardanoNodeConfig) -> Result<EpochLength, EraError> {
    let genesis = config.shelley_genesis().map_err(|e| EraError::Config(e.to_string()))?;
    Ok(EpochLength {
        slot_duration_ms: genesis.slot_length * 1000,
        epoch_slots: genesis.epoch_length,
    })
}

// -- Parameter codecs --

fn decode_params<T: for<'a> minicbor::Decode<'a, ()>>(data: &[u8]) -> Result<T, EraError> {
    minicbor::decode(data).map_err(|e| EraError::Codec(e.to_string()))
}

fn decode_pparams_shelley(data: &[u8]) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Shelley(decode_params::<ShelleyParams>(data)?))
}

fn decode_pparams_allegra(data: &[u8]) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Allegra(decode_params::<ShelleyParams>(data)?))
}

fn decode_pparams_mary(data: &[u8]) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Mary(decode_params::<ShelleyParams>(data)?))
}

fn decode_pparams_alonzo(data: &[u8]) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Alonzo(decode_params::<AlonzoParams>(data)?))
}

fn decode_pparams_babbage(data: &[u8]) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Babbage(decode_params::<BabbageParams>(data)?))
}

fn decode_pparams_conway(data: &[u8]) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Conway(decode_params::<ConwayParams>(data)?))
}

fn decode_pparams_update_pre_babbage(data: &[u8]) -> Result<ProtocolParametersUpdate, EraError> {
    let update: alonzo::ProtocolParamUpdate =
        pallas::codec::minicbor::decode(data).map_err(|e| EraError::Codec(e.to_string()))?;
    Ok(ProtocolParametersUpdate::Alonzo(update))
}

fn decode_pparams_update_babbage(data: &[u8]) -> Result<ProtocolParametersUpdate, EraError> {
    let update: babbage::ProtocolParamUpdate =
        pallas::codec::minicbor::decode(data).map_err(|e| EraError::Codec(e.to_string()))?;
    Ok(ProtocolParametersUpdate::Babbage(update))
}

fn decode_pparams_update_conway(data: &[u8]) -> Result<ProtocolParametersUpdate, EraError> {
    let update: conway::ProtocolParamUpdate =
        pallas::codec::minicbor::decode(data).map_err(|e| EraError::Codec(e.to_string()))?;
    Ok(ProtocolParametersUpdate::Conway(update))
}

// -- Parameter updates --

fn wrong_era(expected: Era, params: &ProtocolParameters) -> EraError {
    EraError::WrongEraType {
        expected,
        got: params.era(),
    }
}

fn shelley_family_update(
    era: Era,
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ShelleyParams, EraError> {
    let params = match (era, current) {
        (Era::Shelley, ProtocolParameters::Shelley(p)) => p,
        (Era::Allegra, ProtocolParameters::Allegra(p)) => p,
        (Era::Mary, ProtocolParameters::Mary(p)) => p,
        _ => return Err(wrong_era(era, current)),
    };
    let ProtocolParametersUpdate::Alonzo(update) = update else {
        return Err(EraError::WrongEraType {
            expected: era,
            got: update.era(),
        });
    };
    let mut params = params.clone();
    params.apply_update(update);
    Ok(params)
}

fn pparams_update_shelley(
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Shelley(shelley_family_update(
        Era::Shelley,
        current,
        update,
    )?))
}

fn pparams_update_allegra(
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Allegra(shelley_family_update(
        Era::Allegra,
        current,
        update,
    )?))
}

fn pparams_update_mary(
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ProtocolParameters, EraError> {
    Ok(ProtocolParameters::Mary(shelley_family_update(
        Era::Mary,
        current,
        update,
    )?))
}

fn pparams_update_alonzo(
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ProtocolParameters, EraError> {
    let ProtocolParameters::Alonzo(params) = current else {
        return Err(wrong_era(Era::Alonzo, current));
    };
    let ProtocolParametersUpdate::Alonzo(update) = update else {
        return Err(EraError::WrongEraType {
            expected: Era::Alonzo,
            got: update.era(),
        });
    };
    let mut params = params.clone();
    params.apply_update(update);
    Ok(ProtocolParameters::Alonzo(params))
}

fn pparams_update_babbage(
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ProtocolParameters, EraError> {
    let ProtocolParameters::Babbage(params) = current else {
        return Err(wrong_era(Era::Babbage, current));
    };
    let ProtocolParametersUpdate::Babbage(update) = update else {
        return Err(EraError::WrongEraType {
            expected: Era::Babbage,
            got: update.era(),
        });
    };
    let mut params = params.clone();
    params.apply_update(update);
    Ok(ProtocolParameters::Babbage(params))
}

fn pparams_update_conway(
    current: &ProtocolParameters,
    update: &ProtocolParametersUpdate,
) -> Result<ProtocolParameters, EraError> {
    let ProtocolParameters::Conway(params) = current else {
        return Err(wrong_era(Era::Conway, current));
    };
    let ProtocolParametersUpdate::Conway(update) = update else {
        return Err(EraError::WrongEraType {
            expected: Era::Conway,
            got: update.era(),
        });
    };
    let mut params = params.clone();
    params.apply_update(update);
    Ok(ProtocolParameters::Conway(params))
}

// -- Hard forks --

fn hard_fork_shelley(
    config: &CardanoNodeConfig,
    _prev: Option<&ProtocolParameters>,
) -> Result<ProtocolParameters, EraError> {
    let genesis = config.shelley_genesis().map_err(|e| EraError::Config(e.to_string()))?;
    Ok(ProtocolParameters::Shelley(ShelleyParams::from_genesis(
        &genesis.protocol_params,
    )))
}

fn hard_fork_allegra(
    _config: &CardanoNodeConfig,
    prev: Option<&ProtocolParameters>,
) -> Result<ProtocolParameters, EraError> {
    match prev {
        Some(ProtocolParameters::Shelley(p)) => Ok(ProtocolParameters::Allegra(p.clone())),
        Some(other) => Err(wrong_era(Era::Shelley, other)),
        None => Err(EraError::Config("Allegra hard fork requires Shelley parameters".into())),
    }
}

fn hard_fork_mary(
    _config: &CardanoNodeConfig,
    prev: Option<&ProtocolParameters>,
) -> Result<ProtocolParameters, EraError> {
    match prev {
        Some(ProtocolParameters::Allegra(p)) => Ok(ProtocolParameters::Mary(p.clone())),
        Some(other) => Err(wrong_era(Era::Allegra, other)),
        None => Err(EraError::Config("Mary hard fork requires Allegra parameters".into())),
    }
}

fn hard_fork_alonzo(
    config: &CardanoNodeConfig,
    prev: Option<&ProtocolParameters>,
) -> Result<ProtocolParameters, EraError> {
    let genesis = config.alonzo_genesis().map_err(|e| EraError::Config(e.to_string()))?;
    match prev {
        Some(ProtocolParameters::Mary(p)) => Ok(ProtocolParameters::Alonzo(
            AlonzoParams::upgrade(p.clone(), genesis),
        )),
        Some(other) => Err(wrong_era(Era::Mary, other)),
        None => Err(EraError::Config("Alonzo hard fork requires Mary parameters".into())),
    }
}

fn hard_fork_babbage(
    _config: &CardanoNodeConfig,
    prev: Option<&ProtocolParameters>,
) -> Result<ProtocolParameters, EraError> {
    match prev {
        Some(ProtocolParameters::Alonzo(p)) => {
            Ok(ProtocolParameters::Babbage(BabbageParams::upgrade(p.clone())))
        }
        Some(other) => Err(wrong_era(Era::Alonzo, other)),
        None => Err(EraError::Config("Babbage hard fork requires Alonzo parameters".into())),
    }
}

fn hard_fork_conway(
    config: &CardanoNodeConfig,
    prev: Option<&ProtocolParameters>,
) -> Result<ProtocolParameters, EraError> {
    let genesis = config.conway_genesis().map_err(|e| EraError::Config(e.to_string()))?;
    match prev {
        Some(ProtocolParameters::Babbage(p)) => Ok(ProtocolParameters::Conway(
            ConwayParams::upgrade(p.clone(), genesis),
        )),
        Some(other) => Err(wrong_era(Era::Babbage, other)),
        None => Err(EraError::Config("Conway hard fork requires Babbage parameters".into())),
    }
}

// -- Nonce calculation --

fn header_nonce_output(header: &BlockHeader) -> Result<Vec<u8>, EraError> {
    let variant = u8::from(header.era);
    let decoded = MultiEraHeader::decode(variant, None, &header.bytes)
        .map_err(|e| EraError::Header(e.to_string()))?;
    decoded.nonce_vrf_output().map_err(|e| EraError::Header(e.to_string()))
}

/// TPraos eras contribute the blake2b-256 digest of the raw VRF output
fn calculate_eta_v_tpraos(
    config: &CardanoNodeConfig,
    prev: &[u8],
    header: &BlockHeader,
) -> Result<Vec<u8>, EraError> {
    let output = header_nonce_output(header)?;
    let block_nonce = Hasher::<256>::hash(&output);
    evolve_eta_v(config, prev, block_nonce.as_ref())
}

/// Praos headers already carry a tagged nonce digest
fn calculate_eta_v_praos(
    config: &CardanoNodeConfig,
    prev: &[u8],
    header: &BlockHeader,
) -> Result<Vec<u8>, EraError> {
    let block_nonce = header_nonce_output(header)?;
    evolve_eta_v(config, prev, &block_nonce)
}
