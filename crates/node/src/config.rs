//! Node Configuration

use anyhow::{bail, Context, Result};
use quorum_consensus::ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A remote node and the DID it hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Hex encoded ed25519 public key of the hosted DID
    pub public_key: String,
    pub peer_id: String,
    /// Base URL of the peer's RPC server
    pub url: String,
}

/// Protocol timeouts in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub consensus_secs: u64,
    pub status_secs: u64,
    pub pledge_rpc_secs: u64,
    pub pledge_poll_ms: u64,
    pub pledge_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            consensus_secs: 600,
            status_secs: 120,
            pledge_rpc_secs: 60,
            pledge_poll_ms: 1000,
            pledge_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            consensus_timeout: Duration::from_secs(self.consensus_secs),
            status_timeout: Duration::from_secs(self.status_secs),
            pledge_rpc_timeout: Duration::from_secs(self.pledge_rpc_secs),
            pledge_poll_interval: Duration::from_millis(self.pledge_poll_ms),
            pledge_timeout: Duration::from_secs(self.pledge_secs),
        }
    }

    /// Upper bound for any single HTTP call
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.consensus_secs.max(self.status_secs))
    }
}

/// Node configuration, read from a JSON file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier other nodes see in provider lists
    pub peer_id: String,
    /// HTTP bind address of the peer API
    pub listen_addr: String,
    /// Loopback bind address of the operator API (transfer, validate)
    pub control_addr: String,
    /// URL other nodes use to reach us, defaults to `http://<listen_addr>`
    pub public_url: Option<String>,
    /// Directory for the sled database
    pub data_dir: PathBuf,
    /// Hex encoded secret keys of the DIDs hosted here
    pub did_secrets: Vec<String>,
    pub peers: Vec<PeerConfig>,
    /// DIDs of the configured quorum
    pub quorum: Vec<String>,
    pub timeouts: TimeoutConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: "peer-local".to_string(),
            listen_addr: "127.0.0.1:20000".to_string(),
            control_addr: "127.0.0.1:20001".to_string(),
            public_url: None,
            data_dir: PathBuf::from("./data"),
            did_secrets: Vec::new(),
            peers: Vec::new(),
            quorum: Vec::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Parsed control address, refused unless it is a loopback address
    pub fn control_addr(&self) -> Result<SocketAddr> {
        let addr: SocketAddr = self
            .control_addr
            .parse()
            .with_context(|| format!("parsing control_addr {}", self.control_addr))?;
        if !addr.ip().is_loopback() {
            bail!("control_addr {addr} is not a loopback address");
        }
        Ok(addr)
    }

    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.listen_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.public_url(), "http://127.0.0.1:20000");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"peer_id": "peer-a", "quorum": ["did:q1"], "timeouts": {"pledge_secs": 5}}"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.peer_id, "peer-a");
        assert_eq!(config.quorum, vec!["did:q1".to_string()]);
        assert_eq!(config.listen_addr, "127.0.0.1:20000");
        assert_eq!(config.control_addr().unwrap().port(), 20001);
        assert_eq!(config.timeouts.pledge_secs, 5);
        assert_eq!(config.timeouts.consensus_secs, 600);
        assert_eq!(
            config.timeouts.consensus_config().pledge_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut config = NodeConfig::default();
        config.public_url = Some("http://10.0.0.7:20000".to_string());
        config.peers.push(PeerConfig {
            public_key: "ab".repeat(32),
            peer_id: "peer-b".to_string(),
            url: "http://10.0.0.8:20000".to_string(),
        });
        config.save(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_control_addr_stays_local() {
        let mut config = NodeConfig::default();
        config.control_addr = "[::1]:9000".to_string();
        assert!(config.control_addr().is_ok());

        config.control_addr = "0.0.0.0:20001".to_string();
        assert!(config.control_addr().is_err());
        config.control_addr = "10.0.0.7:20001".to_string();
        assert!(config.control_addr().is_err());
        config.control_addr = "localhost".to_string();
        assert!(config.control_addr().is_err());
    }
}
