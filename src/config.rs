use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::EngineError;
use crate::ice::TurnServer;
use crate::identity::PrivateKey;

/// Immutable per-run configuration of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the overlay tunnel interface.
    pub iface_name: String,
    /// Overlay address with prefix length, e.g. 100.64.0.1/24.
    pub address: IpNet,
    /// Local tunnel private key.
    pub private_key: PrivateKey,
    /// Local tunnel UDP listen port.
    pub listen_port: u16,
    /// STUN server addresses (host:port) for reflexive candidate discovery.
    pub stun_servers: Vec<String>,
    /// TURN servers with credentials.
    pub turn_servers: Vec<TurnServer>,
}

impl EngineConfig {
    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.iface_name.is_empty() {
            return Err(EngineError::Config("interface name is empty".to_string()));
        }
        if self.iface_name.len() > 15 {
            // IFNAMSIZ minus the trailing NUL
            return Err(EngineError::Config(format!(
                "interface name {} exceeds 15 characters",
                self.iface_name
            )));
        }
        if self.listen_port == 0 {
            return Err(EngineError::Config("listen port must be non-zero".to_string()));
        }
        for server in &self.stun_servers {
            if !server.contains(':') {
                return Err(EngineError::Config(format!(
                    "STUN server {} is missing a port",
                    server
                )));
            }
        }
        for turn in &self.turn_servers {
            if turn.uri.is_empty() {
                return Err(EngineError::Config("TURN server with empty URI".to_string()));
            }
        }
        Ok(())
    }
}

/// Top-level file configuration for the plexus daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_iface")]
    pub interface: String,
    #[serde(default)]
    pub log_level: String,
    pub identity_path: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            interface: default_iface(),
            log_level: "info".to_string(),
            identity_path: None,
        }
    }
}

/// Addresses of the external services and candidate discovery servers.
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    pub management: Option<String>,
    pub signal: Option<String>,
    pub setup_key: Option<String>,
    #[serde(default)]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    #[serde(default = "default_true")]
    pub use_builtin_stun: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            management: None,
            signal: None,
            setup_key: None,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            use_builtin_stun: true,
        }
    }
}

fn default_port() -> u16 {
    51820
}
fn default_iface() -> String {
    "plex0".to_string()
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/plexus/config.toml",
            "~/.plexus/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            iface_name: "utun100".to_string(),
            address: "100.64.0.1/24".parse().unwrap(),
            private_key: PrivateKey::generate(),
            listen_port: 33100,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        }
    }

    #[test]
    fn accepts_valid_engine_config() {
        assert!(engine_config().validate().is_ok());
    }

    #[test]
    fn rejects_bad_engine_config() {
        let mut cfg = engine_config();
        cfg.iface_name.clear();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));

        let mut cfg = engine_config();
        cfg.listen_port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = engine_config();
        cfg.stun_servers.push("stun.example.com".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_file_config_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            interface = "wt0"

            [network]
            management = "mgmt.example.com:33073"
            signal = "signal.example.com:10000"
            stun_servers = ["stun.example.com:3478"]

            [[network.turn_servers]]
            uri = "turn.example.com:3478"
            username = "user"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.interface, "wt0");
        assert_eq!(config.daemon.port, 51820);
        assert_eq!(config.network.stun_servers.len(), 1);
        assert_eq!(config.network.turn_servers[0].username, "user");
        assert!(config.network.use_builtin_stun);
    }
}
