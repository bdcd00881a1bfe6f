//! Configuration file support for the filament node.
//!
//! Loads an optional `filament.toml` from the data directory. CLI flags
//! override config file values; missing file or fields fall back to
//! defaults.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FilamentConfig {
    pub node: NodeSection,
    pub walk: WalkSection,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub listen_host: String,
    /// 0 lets the operating system pick a free port.
    pub listen_port: u16,
    pub data_dir: String,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    pub default_difficulty: u8,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            listen_host: "0.0.0.0".into(),
            listen_port: 0,
            data_dir: "./filament-data".into(),
            bootstrap_peers: vec![],
            max_peers: crate::constants::MAX_PEERS,
            default_difficulty: crate::constants::DEFAULT_DIFFICULTY,
        }
    }
}

/// Random-walk tuning section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WalkSection {
    /// Bias toward heavier subtrees; 0 is a uniform walk.
    pub alpha: f64,
}

impl Default for WalkSection {
    fn default() -> Self {
        WalkSection {
            alpha: crate::constants::DEFAULT_WALK_ALPHA,
        }
    }
}

impl FilamentConfig {
    /// Load configuration from `filament.toml` in the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("filament.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Parse bootstrap peers into socket addresses, skipping malformed
    /// entries.
    pub fn parse_bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.node
            .bootstrap_peers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = FilamentConfig::default();
        assert_eq!(config.node.listen_port, 0);
        assert_eq!(config.node.max_peers, crate::constants::MAX_PEERS);
        assert_eq!(config.walk.alpha, crate::constants::DEFAULT_WALK_ALPHA);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[node]
listen_port = 9040
bootstrap_peers = ["1.2.3.4:9040", "5.6.7.8:9040"]
default_difficulty = 2

[walk]
alpha = 1.5
"#;
        let config: FilamentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.listen_port, 9040);
        assert_eq!(config.node.bootstrap_peers.len(), 2);
        assert_eq!(config.node.default_difficulty, 2);
        assert_eq!(config.walk.alpha, 1.5);
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = FilamentConfig::load(dir.path());
        assert_eq!(config.node.listen_port, 0);
    }

    #[test]
    fn parse_bootstrap_peers_skips_malformed() {
        let mut config = FilamentConfig::default();
        config.node.bootstrap_peers = vec!["1.2.3.4:9040".into(), "bad-addr".into()];
        assert_eq!(config.parse_bootstrap_peers().len(), 1);
    }
}
