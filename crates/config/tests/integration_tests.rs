//! Integration tests for the config crate

use loopd_config::{validate_config, ConfigLoader, DaemonConfig, MAINNET_SERVER};
use loopd_types::Network;
use std::io::Write;
use std::path::{Path, PathBuf};

fn shipped_config(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../config")
        .join(name)
}

#[test]
fn test_load_mainnet_config() {
    let config = ConfigLoader::from_file(&shipped_config("mainnet.toml"))
        .expect("Failed to load mainnet config");

    assert_eq!(config.network, Network::Mainnet);
    assert!(config.tls.is_some());
    assert!(config.logging.json);
    assert_eq!(config.swap_server_host().as_deref(), Some(MAINNET_SERVER));
    assert!(validate_config(&config).is_ok());
}

#[test]
fn test_load_testnet_config() {
    let config = ConfigLoader::from_file(&shipped_config("testnet.toml"))
        .expect("Failed to load testnet config");

    assert_eq!(config.network, Network::Testnet);
    assert_eq!(config.cors_origin, "*");
    assert_eq!(config.logging.level, "debug");
    assert!(validate_config(&config).is_ok());
}

#[test]
fn test_load_regtest_config() {
    let config = ConfigLoader::from_file(&shipped_config("regtest.toml"))
        .expect("Failed to load regtest config");

    assert_eq!(config.network, Network::Regtest);
    assert_eq!(config.backend.kind, "simulated");
    assert_eq!(config.subscriber_buffer, 32);
    assert!(validate_config(&config).is_ok());
}

#[test]
fn test_env_overrides() {
    std::env::set_var("LOOPDENVTEST_NETWORK", "testnet");
    std::env::set_var("LOOPDENVTEST_RPC_LISTEN", "0.0.0.0:12010");
    std::env::set_var("LOOPDENVTEST_LOGGING__LEVEL", "warn");

    let config = ConfigLoader::from_env_with_prefix("LOOPDENVTEST").unwrap();
    assert_eq!(config.network, Network::Testnet);
    assert_eq!(config.rpc_listen, "0.0.0.0:12010");
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.rest_listen, DaemonConfig::default().rest_listen);
}

#[test]
fn test_file_with_env_overlay() {
    let toml = r#"
network = "testnet"
rpc_listen = "localhost:11010"

[logging]
level = "info"
    "#;

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(toml.as_bytes()).unwrap();
    file.flush().unwrap();

    std::env::set_var("LOOPDOVERLAYTEST_RPC_LISTEN", "localhost:15010");

    let config = ConfigLoader::from_file_with_env(file.path(), "LOOPDOVERLAYTEST").unwrap();
    assert_eq!(config.network, Network::Testnet);
    assert_eq!(config.rpc_listen, "localhost:15010");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_file_with_env_missing_file() {
    let result = ConfigLoader::from_file_with_env(Path::new("/nonexistent/loopd.toml"), "LOOPD");
    assert!(result.is_err());
}

#[test]
fn test_invalid_toml_is_rejected() {
    assert!(ConfigLoader::from_toml("network = [").is_err());
    assert!(ConfigLoader::from_toml(r#"network = "moonnet""#).is_err());
}
