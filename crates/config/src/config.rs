//! Core configuration structures for the loop swap daemon

use loopd_types::Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Swap server used on mainnet when none is configured
pub const MAINNET_SERVER: &str = "swap.lightning.today:11010";

/// Swap server used on testnet when none is configured
pub const TESTNET_SERVER: &str = "test.swap.lightning.today:11010";

/// File name of the credential root key database inside the network directory
pub const ROOT_KEY_DB_NAME: &str = "macaroons.db";

/// File name of the default macaroon inside the network directory
pub const DEFAULT_MACAROON_NAME: &str = "loop.macaroon";

/// Main daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Network to run on
    #[serde(default)]
    pub network: Network,

    /// Address the framed RPC endpoint listens on
    #[serde(default = "default_rpc_listen")]
    pub rpc_listen: String,

    /// Address the REST gateway listens on (empty disables the gateway)
    #[serde(default = "default_rest_listen")]
    pub rest_listen: String,

    /// Value for the Access-Control-Allow-Origin header (empty disables it)
    #[serde(default)]
    pub cors_origin: String,

    /// Base directory for daemon data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Location of the default macaroon; derived from the data dir if unset
    #[serde(default)]
    pub macaroon_path: Option<PathBuf>,

    /// TLS material for both endpoints; plaintext when unset
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Swap server connection
    #[serde(default)]
    pub server: SwapServerConfig,

    /// Wallet backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Enable the experimental swap protocol
    #[serde(default)]
    pub enable_experimental: bool,

    /// Queue depth for each status subscriber
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TLS certificate and key for the network endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,

    /// PEM private key
    pub key_path: PathBuf,
}

/// Swap server connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SwapServerConfig {
    /// host:port of the swap server; network default when empty
    #[serde(default)]
    pub host: String,

    /// Disable TLS towards the swap server
    #[serde(default)]
    pub no_tls: bool,
}

/// Wallet backend connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind understood by the connector
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    /// host:port of the backend node
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Directory holding the backend's macaroons
    #[serde(default)]
    pub macaroon_dir: Option<PathBuf>,

    /// Backend TLS certificate
    #[serde(default)]
    pub tls_path: Option<PathBuf>,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl DaemonConfig {
    /// Directory for network-specific data
    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.as_str())
    }

    /// Resolved location of the default macaroon
    pub fn macaroon_path(&self) -> PathBuf {
        self.macaroon_path
            .clone()
            .unwrap_or_else(|| self.network_dir().join(DEFAULT_MACAROON_NAME))
    }

    /// Location of the credential root key database
    pub fn root_key_db_path(&self) -> PathBuf {
        self.network_dir().join(ROOT_KEY_DB_NAME)
    }

    /// Swap server address, falling back to the network default
    pub fn swap_server_host(&self) -> Option<String> {
        if !self.server.host.is_empty() {
            return Some(self.server.host.clone());
        }

        match self.network {
            Network::Mainnet => Some(MAINNET_SERVER.to_string()),
            Network::Testnet => Some(TESTNET_SERVER.to_string()),
            Network::Regtest | Network::Simnet => None,
        }
    }

    /// Whether the REST gateway is enabled
    pub fn rest_enabled(&self) -> bool {
        !self.rest_listen.trim().is_empty()
    }

    /// Convenience constructor for a given network and data dir
    pub fn for_network(network: Network, data_dir: impl AsRef<Path>) -> Self {
        Self {
            network,
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            rpc_listen: default_rpc_listen(),
            rest_listen: default_rest_listen(),
            cors_origin: String::new(),
            data_dir: default_data_dir(),
            macaroon_path: None,
            tls: None,
            server: SwapServerConfig::default(),
            backend: BackendConfig::default(),
            enable_experimental: false,
            subscriber_buffer: default_subscriber_buffer(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            host: default_backend_host(),
            macaroon_dir: None,
            tls_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_rpc_listen() -> String {
    "localhost:11010".to_string()
}

fn default_rest_listen() -> String {
    "localhost:8081".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".loop")
}

fn default_backend_kind() -> String {
    "simulated".to_string()
}

fn default_backend_host() -> String {
    "localhost:10009".to_string()
}

fn default_subscriber_buffer() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_per_network() {
        let mut config = DaemonConfig::default();
        assert_eq!(config.swap_server_host().as_deref(), Some(MAINNET_SERVER));

        config.network = Network::Testnet;
        assert_eq!(config.swap_server_host().as_deref(), Some(TESTNET_SERVER));

        config.network = Network::Regtest;
        assert_eq!(config.swap_server_host(), None);

        config.server.host = "localhost:11009".to_string();
        assert_eq!(config.swap_server_host().as_deref(), Some("localhost:11009"));
    }

    #[test]
    fn test_derived_paths() {
        let config = DaemonConfig::for_network(Network::Testnet, "/var/lib/loop");
        assert_eq!(config.network_dir(), PathBuf::from("/var/lib/loop/testnet"));
        assert_eq!(
            config.macaroon_path(),
            PathBuf::from("/var/lib/loop/testnet/loop.macaroon")
        );
        assert_eq!(
            config.root_key_db_path(),
            PathBuf::from("/var/lib/loop/testnet/macaroons.db")
        );
    }

    #[test]
    fn test_rest_disabled_when_empty() {
        let config = DaemonConfig {
            rest_listen: "  ".to_string(),
            ..Default::default()
        };
        assert!(!config.rest_enabled());
    }
}
