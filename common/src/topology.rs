//! Network topology document

use std::path::Path;

use anyhow::{Context, Result};

/// A single reachable peer endpoint
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessPoint {
    pub address: String,
    pub port: u16,
}

impl AccessPoint {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A group of roots sharing an advertise flag
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootGroup {
    #[serde(default)]
    pub access_points: Vec<AccessPoint>,
    #[serde(default)]
    pub advertise: bool,
}

/// The node topology document
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConfig {
    #[serde(default)]
    pub bootstrap_peers: Vec<AccessPoint>,
    #[serde(default)]
    pub local_roots: Vec<RootGroup>,
    #[serde(default)]
    pub public_roots: Vec<RootGroup>,
}

impl TopologyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read topology file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("could not parse topology file {}", path.display()))
    }
}
