//! End-to-end tests running the daemon from the shipped configuration
//!
//! Unlike the daemon crate's own tests these use the on-disk root key
//! database, the way `loopd` runs in production.

use loopd_auth::Macaroon;
use loopd_config::{ConfigLoader, DaemonConfig};
use loopd_daemon::{Daemon, DaemonError, ListenerConfig, RpcClient};
use loopd_swap::SimulatedConnector;
use loopd_types::{methods, GetInfoResponse, Network};
use serde_json::json;
use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn regtest_config(data_dir: &Path) -> DaemonConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/regtest.toml");
    let mut config = ConfigLoader::from_file(&path).expect("shipped regtest config loads");
    config.data_dir = data_dir.to_path_buf();
    config
}

fn rpc_only_listeners() -> ListenerConfig {
    ListenerConfig::new(
        Box::new(|| StdTcpListener::bind("127.0.0.1:0")),
        Box::new(|| Ok(None)),
    )
}

fn simulated_daemon(config: DaemonConfig) -> Daemon {
    Daemon::new(config, rpc_only_listeners()).with_connector(Arc::new(SimulatedConnector {
        tick: Some(Duration::from_millis(50)),
    }))
}

#[tokio::test]
async fn test_daemon_from_shipped_config() {
    let dir = TempDir::new().unwrap();
    let config = regtest_config(dir.path());
    let daemon = simulated_daemon(config.clone());

    daemon.start().await.unwrap();

    assert!(config.root_key_db_path().exists());
    let token = tokio::fs::read_to_string(config.macaroon_path()).await.unwrap();
    let admin = Macaroon::decode(&token).unwrap();
    assert!(!admin.permissions().is_empty());

    let client = RpcClient::new(daemon.rpc_addr().unwrap());
    let info: GetInfoResponse = client
        .call_typed(methods::GET_INFO, Some(token), &json!({}))
        .await
        .unwrap();
    assert_eq!(info.network, Network::Regtest);
    assert_eq!(info.macaroon_path, config.macaroon_path().display().to_string());
    assert!(info.rest_listen.is_empty());

    daemon.stop();
    daemon.wait().await.unwrap();
}

#[tokio::test]
async fn test_restart_reuses_credentials() {
    let dir = TempDir::new().unwrap();
    let config = regtest_config(dir.path());

    let first = simulated_daemon(config.clone());
    first.start().await.unwrap();
    let token = tokio::fs::read_to_string(config.macaroon_path()).await.unwrap();
    first.stop();
    first.wait().await.unwrap();

    // Same root key, so the token written by the first run stays valid
    let second = simulated_daemon(config.clone());
    second.start().await.unwrap();
    assert_eq!(
        tokio::fs::read_to_string(config.macaroon_path()).await.unwrap(),
        token
    );
    let client = RpcClient::new(second.rpc_addr().unwrap());
    client
        .call(methods::LIST_SWAPS, Some(token), json!({}))
        .await
        .unwrap();

    second.stop();
    second.wait().await.unwrap();
}

#[tokio::test]
async fn test_immediate_restarts_reopen_the_store() {
    let dir = TempDir::new().unwrap();
    let config = regtest_config(dir.path());

    for _ in 0..5 {
        let daemon = simulated_daemon(config.clone());
        daemon.start().await.unwrap();
        daemon.stop();
        daemon.wait().await.unwrap();
    }
}

#[tokio::test]
async fn test_second_daemon_on_same_data_dir_fails() {
    let dir = TempDir::new().unwrap();
    let config = regtest_config(dir.path());

    // Root key database already exists, so the first daemon only reads it
    let previous = simulated_daemon(config.clone());
    previous.start().await.unwrap();
    previous.stop();
    previous.wait().await.unwrap();

    let first = simulated_daemon(config.clone());
    first.start().await.unwrap();

    let second = simulated_daemon(config);
    match second.start().await {
        Err(DaemonError::Initialization(message)) => {
            assert!(message.contains("locked"), "{message}");
        }
        other => panic!("expected the root key database to be locked, got {other:?}"),
    }
    assert!(matches!(second.wait().await, Err(DaemonError::NotRunning)));

    first.stop();
    first.wait().await.unwrap();
}
