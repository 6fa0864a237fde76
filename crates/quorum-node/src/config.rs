use std::path::{Path, PathBuf};

use quorum_core::constants::ConsensusParams;
use quorum_core::MinerKind;
use serde::{Deserialize, Serialize};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,

    /// Consensus parameters; must match the rest of the network.
    #[serde(default)]
    pub consensus: ConsensusParams,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub instance: InstanceConfig,

    /// Known miners of the network besides the local one.
    #[serde(default)]
    pub peers: Vec<PeerMiner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name/identifier
    pub name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Keystore file holding the raw miner key (hex, 32 bytes).
    pub keystore: PathBuf,

    /// Role of the local miner.
    #[serde(default = "default_miner_kind")]
    pub miner_kind: MinerKind,

    /// Stake backing the local miner.
    #[serde(default = "default_stake")]
    pub stake: u64,

    /// Development mode: the node seeds a single-member genesis group so a
    /// standalone chain can produce blocks immediately.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_miner_kind() -> MinerKind {
    MinerKind::Verifier
}

fn default_stake() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Prune old chain state instead of keeping a full archive.
    #[serde(default)]
    pub prune_mode: bool,

    /// Blocks kept in full above the checkpoint when pruning.
    #[serde(default = "default_persistence_count")]
    pub persistence_count: u64,
}

fn default_persistence_count() -> u64 {
    256
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { prune_mode: false, persistence_count: default_persistence_count() }
    }
}

/// Sharding of the local secret store when several node instances share one
/// machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub index: u32,
}

/// A peer miner known from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMiner {
    /// BLS public key, hex.
    pub pubkey: String,
    /// VRF public key, hex.
    pub vrf_pubkey: String,
    pub stake: u64,
    pub kind: MinerKind,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Secret-store file for this instance.
    pub fn sk_store_path(&self) -> PathBuf {
        self.node
            .data_dir
            .join(format!("groupsk{}.store", self.instance.index))
    }

    pub fn chain_db_path(&self) -> PathBuf {
        self.node.data_dir.join("chain")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let raw = r#"
            [node]
            name = "alpha"
            data_dir = "/tmp/quorum"
            keystore = "/tmp/quorum/key"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.consensus.epoch, 200);
        assert_eq!(config.instance.index, 0);
        assert!(!config.chain.prune_mode);
        assert!(config.peers.is_empty());
        assert_eq!(config.sk_store_path(), PathBuf::from("/tmp/quorum/groupsk0.store"));
    }

    #[test]
    fn test_sections_override_defaults() {
        let raw = r#"
            [node]
            name = "beta"
            data_dir = "/data"
            keystore = "/data/key"
            stake = 777

            [consensus]
            epoch = 100
            group_min = 5
            group_max = 9
            max_group_cast_time = 4
            group_life_epochs = 3

            [instance]
            index = 2

            [chain]
            prune_mode = true
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.consensus.epoch, 100);
        assert_eq!(config.consensus.group_max, 9);
        assert_eq!(config.node.stake, 777);
        assert!(config.chain.prune_mode);
        assert_eq!(config.sk_store_path(), PathBuf::from("/data/groupsk2.store"));
    }
}
