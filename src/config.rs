//! `NodeConfig`: the deployment-facing knobs, layered built-in defaults →
//! optional TOML file → environment overrides, with CLI flags (see
//! [`crate::main`]) taking the highest precedence by being applied after
//! [`NodeConfig::load`] returns. Everything else (timeouts, rate-limit
//! constants, KD-tree weights) stays a compiled-in constant near the
//! module that owns it — these are protocol invariants, not deployment
//! knobs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::transport::TransportConfig;

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:9091".parse().expect("valid default listen address")
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("./config")
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("./run")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ws_path: default_ws_path(),
            tls_cert_path: None,
            tls_key_path: None,
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

impl NodeConfig {
    /// Layer an optional TOML file over the built-in defaults, then apply
    /// the handful of environment overrides §6 names. CLI flags are
    /// layered on top of this by the caller (highest precedence).
    pub fn load(file: Option<&Path>) -> NodeResult<Self> {
        let mut config = match file {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw).map_err(|e| NodeError::Corrupt(format!("config file {}: {e}", path.display())))?
            }
            _ => Self::default(),
        };

        if let Ok(v) = std::env::var("OVERLAY_LISTEN_ADDR") {
            config.listen_addr = v
                .parse()
                .map_err(|e| NodeError::Corrupt(format!("OVERLAY_LISTEN_ADDR: {e}")))?;
        }
        if let Ok(v) = std::env::var("OVERLAY_WS_PATH") {
            config.ws_path = v;
        }
        if let Ok(v) = std::env::var("OVERLAY_MAX_CONNECTIONS") {
            config.max_connections = v
                .parse()
                .map_err(|e| NodeError::Corrupt(format!("OVERLAY_MAX_CONNECTIONS: {e}")))?;
        }
        if let Ok(v) = std::env::var("OVERLAY_MAX_MESSAGE_SIZE") {
            config.max_message_size = v
                .parse()
                .map_err(|e| NodeError::Corrupt(format!("OVERLAY_MAX_MESSAGE_SIZE: {e}")))?;
        }
        if let Ok(v) = std::env::var("OVERLAY_TLS_CERT") {
            config.tls_cert_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("OVERLAY_TLS_KEY") {
            config.tls_key_path = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.data_dir.join("node").join("private.key")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.config_dir.join("node.json")
    }

    pub fn peers_path(&self) -> PathBuf {
        self.config_dir.join("peers.json")
    }

    /// Unix domain socket for local RPC; out of scope for the overlay wire
    /// protocol (§6), recorded here only as the conventional path.
    pub fn control_socket_path(&self) -> PathBuf {
        self.runtime_dir.join("node.sock")
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            listen_addr: self.listen_addr,
            ws_path: self.ws_path.clone(),
            max_connections: self.max_connections,
            max_message_size: self.max_message_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr.port(), 9091);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:9999\"\nmax_connections = 5\n").unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.ws_path, "/ws"); // untouched fields keep their default
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = NodeConfig::load(Some(Path::new("/nonexistent/node.toml"))).unwrap();
        assert_eq!(config.listen_addr, NodeConfig::default().listen_addr);
    }
}
