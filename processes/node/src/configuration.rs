use std::path::PathBuf;

use anyhow::{Context, Result};
use config::Config;
use dingo_common::{BlockHash, Point};

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub network_magic: u32,
    pub data_dir: PathBuf,
    /// Storage backend, one of the builder's known names
    pub store: String,
    pub security_param: u64,
    pub intersect_tip: bool,
    /// Explicit sync start points as `slot.hash` strings
    #[serde(default)]
    pub intersect_points: Vec<String>,
    pub topology: PathBuf,
    pub listen_address: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub outbound_source_port: Option<u16>,
    pub shelley_genesis_hash: Option<String>,
    pub byron_genesis: Option<PathBuf>,
    pub shelley_genesis: Option<PathBuf>,
    pub alonzo_genesis: Option<PathBuf>,
    pub conway_genesis: Option<PathBuf>,
}

impl NodeConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn parse_intersect_points(&self) -> Result<Vec<Point>> {
        self.intersect_points
            .iter()
            .map(|raw| {
                let (slot, hash) = raw
                    .split_once('.')
                    .with_context(|| format!("bad intersect point {raw}, expected slot.hash"))?;
                let slot: u64 =
                    slot.parse().with_context(|| format!("bad slot in intersect point {raw}"))?;
                let hash: BlockHash =
                    hash.parse().with_context(|| format!("bad hash in intersect point {raw}"))?;
                Ok(Point::specific(slot, hash))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_overrides() {
        let config = Config::builder().build().unwrap();
        let node = NodeConfig::try_load(&config).unwrap();
        assert_eq!(node.network_magic, 764824073);
        assert_eq!(node.store, "fjall");
        assert!(node.intersect_tip);
        assert!(node.parse_intersect_points().unwrap().is_empty());
    }

    #[test]
    fn overrides_win_over_defaults() {
        let config = Config::builder()
            .set_override("network-magic", 2i64)
            .unwrap()
            .set_override("intersect-tip", false)
            .unwrap()
            .build()
            .unwrap();
        let node = NodeConfig::try_load(&config).unwrap();
        assert_eq!(node.network_magic, 2);
        assert!(!node.intersect_tip);
    }

    #[test]
    fn intersect_points_parse_slot_and_hash() {
        let config = Config::builder()
            .set_override(
                "intersect-points",
                vec![
                    "100.000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f"
                        .to_string(),
                ],
            )
            .unwrap()
            .build()
            .unwrap();
        let node = NodeConfig::try_load(&config).unwrap();
        let points = node.parse_intersect_points().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].slot(), Some(100));

        let config = Config::builder()
            .set_override("intersect-points", vec!["nonsense".to_string()])
            .unwrap()
            .build()
            .unwrap();
        let node = NodeConfig::try_load(&config).unwrap();
        assert!(node.parse_intersect_points().is_err());
    }
}
