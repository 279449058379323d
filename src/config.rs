//! Configuration for the validator node.
//!
//! Options come from a JSON config file, with every field falling back to
//! an environment variable and then to a hardcoded default. Startup fails
//! before any task is launched when a required option is missing or two
//! options contradict each other.

use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;

/// A validated secp256k1 private key (32 bytes, 0x-hex).
#[derive(Clone, Copy)]
pub struct Secp256k1Key(B256);

impl Secp256k1Key {
    pub fn signer(&self) -> PrivateKeySigner {
        // The byte string was validated on parse.
        PrivateKeySigner::from_bytes(&self.0).expect("validated secp256k1 key")
    }
}

impl std::fmt::Debug for Secp256k1Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secp256k1Key(<redacted>)")
    }
}

impl FromStr for Secp256k1Key {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b256 = B256::from_str(s).map_err(|e| format!("invalid secp256k1 key: {e}"))?;
        PrivateKeySigner::from_bytes(&b256).map_err(|e| format!("invalid secp256k1 key: {e}"))?;
        Ok(Self(b256))
    }
}

impl<'de> Deserialize<'de> for Secp256k1Key {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A validated ed25519 seed (32 bytes, Base58).
#[derive(Clone, Copy)]
pub struct Ed25519Seed([u8; 32]);

impl Ed25519Seed {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Ed25519Seed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Ed25519Seed(<redacted>)")
    }
}

impl FromStr for Ed25519Seed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| format!("invalid base58 seed: {e}"))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("seed must be 32 bytes, got {}", v.len()))?;
        Ok(Self(seed))
    }
}

impl<'de> Deserialize<'de> for Ed25519Seed {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Waves-side options.
#[derive(Debug, Clone, Deserialize)]
pub struct WavesConfig {
    /// REST endpoint of a Waves node, e.g. `https://nodes.wavesnodes.com`.
    #[serde(default = "defaults::waves_node_url")]
    pub node_url: Option<Url>,
    /// One-character network tag: `W` mainnet, `T` testnet.
    #[serde(default = "defaults::waves_network_tag")]
    pub network_tag: String,
    /// Finality depth before a block's events are acted on.
    #[serde(default = "defaults::waves_confirmations")]
    pub confirmations: u64,
    /// Base58 address of the bridge dApp.
    #[serde(default = "defaults::waves_bridge_address")]
    pub bridge_address: Option<String>,
}

/// Unit0-side options.
#[derive(Debug, Clone, Deserialize)]
pub struct Unit0Config {
    /// JSON-RPC endpoint of a Unit0 node.
    #[serde(default = "defaults::unit0_rpc_url")]
    pub rpc_url: Option<Url>,
    /// Numeric chain id, enters both release digests.
    #[serde(default = "defaults::unit0_chain_id")]
    pub chain_id: u64,
    /// Finality depth before a block's logs are acted on.
    #[serde(default = "defaults::unit0_confirmations")]
    pub confirmations: u64,
    /// 0x-hex address of the bridge contract.
    #[serde(default = "defaults::unit0_bridge_address")]
    pub bridge_address: Option<String>,
}

/// Gossip overlay options.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "defaults::overlay_listen_port")]
    pub listen_port: u16,
    /// Multiaddrs of bootstrap peers; empty means standalone operation.
    #[serde(default = "defaults::overlay_bootstrap_peers")]
    pub bootstrap_peers: Vec<String>,
}

/// Read-only status HTTP options.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusHttpConfig {
    #[serde(default = "defaults::status_http_enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::status_http_port")]
    pub port: u16,
}

/// Top-level node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::waves")]
    pub waves: WavesConfig,
    #[serde(default = "defaults::unit0")]
    pub unit0: Unit0Config,
    /// secp256k1 key producing Unit0-destination attestations. Required.
    #[serde(default = "defaults::validator_secp256k1_key")]
    pub validator_secp256k1_key: Option<Secp256k1Key>,
    /// ed25519 seed producing Waves-destination attestations. Optional;
    /// without it the Waves destination is disabled.
    #[serde(default = "defaults::validator_ed25519_seed")]
    pub validator_ed25519_seed: Option<Ed25519Seed>,
    #[serde(default = "defaults::overlay")]
    pub overlay: OverlayConfig,
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "defaults::status_http")]
    pub status_http: StatusHttpConfig,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Force the initial Waves watermark, overriding the persisted one.
    #[serde(default = "defaults::start_block_waves")]
    pub start_block_waves: Option<u64>,
    /// Force the initial Unit0 watermark, overriding the persisted one.
    #[serde(default = "defaults::start_block_unit0")]
    pub start_block_unit0: Option<u64>,
}

mod defaults {
    use super::{
        Ed25519Seed, OverlayConfig, Secp256k1Key, StatusHttpConfig, Unit0Config, WavesConfig,
    };
    use std::env;
    use std::path::PathBuf;
    use url::Url;

    fn var(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }

    pub fn waves_node_url() -> Option<Url> {
        var("WAVES_NODE_URL").and_then(|s| s.parse().ok())
    }
    pub fn waves_network_tag() -> String {
        var("WAVES_NETWORK_TAG").unwrap_or_else(|| "W".to_string())
    }
    pub fn waves_confirmations() -> u64 {
        var("WAVES_CONFIRMATIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10)
    }
    pub fn waves_bridge_address() -> Option<String> {
        var("WAVES_BRIDGE_ADDRESS")
    }
    pub fn waves() -> WavesConfig {
        WavesConfig {
            node_url: waves_node_url(),
            network_tag: waves_network_tag(),
            confirmations: waves_confirmations(),
            bridge_address: waves_bridge_address(),
        }
    }

    pub fn unit0_rpc_url() -> Option<Url> {
        var("UNIT0_RPC_URL").and_then(|s| s.parse().ok())
    }
    pub fn unit0_chain_id() -> u64 {
        var("UNIT0_CHAIN_ID")
            .and_then(|s| s.parse().ok())
            .unwrap_or(88811)
    }
    pub fn unit0_confirmations() -> u64 {
        var("UNIT0_CONFIRMATIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(32)
    }
    pub fn unit0_bridge_address() -> Option<String> {
        var("UNIT0_BRIDGE_ADDRESS")
    }
    pub fn unit0() -> Unit0Config {
        Unit0Config {
            rpc_url: unit0_rpc_url(),
            chain_id: unit0_chain_id(),
            confirmations: unit0_confirmations(),
            bridge_address: unit0_bridge_address(),
        }
    }

    pub fn validator_secp256k1_key() -> Option<Secp256k1Key> {
        var("VALIDATOR_SECP256K1_KEY").and_then(|s| s.parse().ok())
    }
    pub fn validator_ed25519_seed() -> Option<Ed25519Seed> {
        var("VALIDATOR_ED25519_SEED").and_then(|s| s.parse().ok())
    }

    pub fn overlay_listen_port() -> u16 {
        var("OVERLAY_LISTEN_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(9611)
    }
    pub fn overlay_bootstrap_peers() -> Vec<String> {
        var("OVERLAY_BOOTSTRAP_PEERS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
    pub fn overlay() -> OverlayConfig {
        OverlayConfig {
            listen_port: overlay_listen_port(),
            bootstrap_peers: overlay_bootstrap_peers(),
        }
    }

    pub fn data_dir() -> PathBuf {
        var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn status_http_enabled() -> bool {
        var("STATUS_HTTP_ENABLED")
            .and_then(|s| s.parse().ok())
            .unwrap_or(true)
    }
    pub fn status_http_port() -> u16 {
        var("STATUS_HTTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080)
    }
    pub fn status_http() -> StatusHttpConfig {
        StatusHttpConfig {
            enabled: status_http_enabled(),
            port: status_http_port(),
        }
    }

    pub fn log_level() -> String {
        var("LOG_LEVEL").unwrap_or_else(|| "info".to_string())
    }

    pub fn start_block_waves() -> Option<u64> {
        var("START_BLOCK_WAVES").and_then(|s| s.parse().ok())
    }
    pub fn start_block_unit0() -> Option<u64> {
        var("START_BLOCK_UNIT0").and_then(|s| s.parse().ok())
    }
}

impl Default for Config {
    fn default() -> Self {
        // Serde defaults double as the no-file configuration path.
        serde_json::from_str("{}").expect("empty config object deserializes")
    }
}

/// Configuration error types. All of them abort startup with exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Missing required option: {0}")]
    Missing(&'static str),
    #[error("Invalid option {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

impl Config {
    /// Load configuration from an optional JSON file path.
    ///
    /// With no file, every option resolves from the environment or its
    /// default. The result is not yet validated; call [`Config::validate`]
    /// before starting the node.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
                Ok(serde_json::from_str(&content)?)
            }
            None => Ok(Config::default()),
        }
    }

    /// Validate cross-field constraints and presence of required options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validator_secp256k1_key.is_none() {
            return Err(ConfigError::Missing("validator_secp256k1_key"));
        }
        if self.waves.node_url.is_none() {
            return Err(ConfigError::Missing("waves.node_url"));
        }
        if self.waves.bridge_address.is_none() {
            return Err(ConfigError::Missing("waves.bridge_address"));
        }
        if self.unit0.rpc_url.is_none() {
            return Err(ConfigError::Missing("unit0.rpc_url"));
        }
        if self.unit0.bridge_address.is_none() {
            return Err(ConfigError::Missing("unit0.bridge_address"));
        }
        self.waves_network_byte()?;
        if self.unit0.chain_id == 0 {
            return Err(ConfigError::Invalid {
                option: "unit0.chain_id",
                reason: "must be nonzero".into(),
            });
        }
        let bridge = self.unit0.bridge_address.as_deref().unwrap_or_default();
        bridge
            .parse::<alloy::primitives::Address>()
            .map_err(|e| ConfigError::Invalid {
                option: "unit0.bridge_address",
                reason: e.to_string(),
            })?;
        if self.unit0.confirmations == 0 || self.waves.confirmations == 0 {
            return Err(ConfigError::Invalid {
                option: "confirmations",
                reason: "finality depth must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// The Waves network tag as a single byte.
    pub fn waves_network_byte(&self) -> Result<u8, ConfigError> {
        let tag = &self.waves.network_tag;
        let mut chars = tag.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => Ok(c as u8),
            _ => Err(ConfigError::Invalid {
                option: "waves.network_tag",
                reason: format!("expected a single ASCII character, got {tag:?}"),
            }),
        }
    }

    /// Whether Waves-destination signing and relay are enabled.
    pub fn waves_destination_enabled(&self) -> bool {
        self.validator_ed25519_seed.is_some()
    }
}

impl Display for Config {
    /// Human summary for `check-config`; never prints key material.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "waves: url={} tag={} confirmations={} bridge={}",
            self.waves
                .node_url
                .as_ref()
                .map(Url::as_str)
                .unwrap_or("<missing>"),
            self.waves.network_tag,
            self.waves.confirmations,
            self.waves.bridge_address.as_deref().unwrap_or("<missing>"),
        )?;
        writeln!(
            f,
            "unit0: url={} chain_id={} confirmations={} bridge={}",
            self.unit0
                .rpc_url
                .as_ref()
                .map(Url::as_str)
                .unwrap_or("<missing>"),
            self.unit0.chain_id,
            self.unit0.confirmations,
            self.unit0.bridge_address.as_deref().unwrap_or("<missing>"),
        )?;
        writeln!(
            f,
            "keys: secp256k1={} ed25519={}",
            if self.validator_secp256k1_key.is_some() {
                "set"
            } else {
                "<missing>"
            },
            if self.validator_ed25519_seed.is_some() {
                "set"
            } else {
                "absent (waves destination disabled)"
            },
        )?;
        writeln!(
            f,
            "overlay: port={} bootstrap_peers={}",
            self.overlay.listen_port,
            self.overlay.bootstrap_peers.len()
        )?;
        writeln!(
            f,
            "status_http: enabled={} port={}",
            self.status_http.enabled, self.status_http.port
        )?;
        write!(f, "data_dir: {}", self.data_dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "waves": {
                "node_url": "https://nodes.wavesnodes.com",
                "network_tag": "W",
                "bridge_address": "3PBridgeDApp111111111111111111111"
            },
            "unit0": {
                "rpc_url": "https://rpc.unit0.dev",
                "chain_id": 88811,
                "bridge_address": "0x4025a8ee89daead315de690f0c250cab5309a115"
            },
            "validator_secp256k1_key":
                "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
        }"#
    }

    #[test]
    fn test_minimal_config_validates() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.waves_network_byte().unwrap(), b'W');
        assert!(!config.waves_destination_enabled());
        assert_eq!(config.unit0.confirmations, 32);
        assert_eq!(config.waves.confirmations, 10);
    }

    #[test]
    fn test_missing_secp_key_rejected() {
        let json = r#"{
            "waves": {
                "node_url": "https://nodes.wavesnodes.com",
                "bridge_address": "3PBridgeDApp111111111111111111111"
            },
            "unit0": {
                "rpc_url": "https://rpc.unit0.dev",
                "bridge_address": "0x4025a8ee89daead315de690f0c250cab5309a115"
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        match config.validate() {
            Err(ConfigError::Missing(option)) => {
                assert_eq!(option, "validator_secp256k1_key")
            }
            other => panic!("expected missing key error, got {other:?}"),
        }
    }

    #[test]
    fn test_multichar_network_tag_rejected() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.waves.network_tag = "WW".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ed25519_seed_parses_base58() {
        let seed_b58 = bs58::encode([7u8; 32]).into_string();
        let seed: Ed25519Seed = seed_b58.parse().unwrap();
        assert_eq!(seed.as_bytes(), &[7u8; 32]);
        assert!("tooshort".parse::<Ed25519Seed>().is_err());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        let debug = format!("{:?}", config.validator_secp256k1_key);
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("59c6995e"));
    }
}
