use loopd_config::DaemonConfig;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener as StdTcpListener};
use tokio::net::TcpListener;

use crate::error::DaemonError;
use crate::tls::TlsMaterial;

const RPC_LISTENER: &str = "RPC listener";
const REST_LISTENER: &str = "REST gateway listener";

pub type RpcListenerFactory = Box<dyn FnOnce() -> io::Result<StdTcpListener> + Send>;

/// Returns `None` when the gateway is disabled
pub type RestListenerFactory = Box<dyn FnOnce() -> io::Result<Option<StdTcpListener>> + Send>;

/// Listener factories plus optional TLS material, consumed once at startup
pub struct ListenerConfig {
    pub(crate) rpc_endpoint: String,
    pub(crate) rest_endpoint: String,
    pub(crate) rpc: RpcListenerFactory,
    pub(crate) rest: RestListenerFactory,
    pub(crate) tls: Option<TlsMaterial>,
}

impl ListenerConfig {
    pub fn new(rpc: RpcListenerFactory, rest: RestListenerFactory) -> Self {
        Self {
            rpc_endpoint: RPC_LISTENER.to_string(),
            rest_endpoint: REST_LISTENER.to_string(),
            rpc,
            rest,
            tls: None,
        }
    }

    /// Bind the addresses from the daemon configuration
    pub fn from_config(config: &DaemonConfig) -> Self {
        let rpc_addr = config.rpc_listen.clone();
        let rest_addr = config.rest_listen.clone();
        let rest_enabled = config.rest_enabled();

        let rpc = {
            let addr = rpc_addr.clone();
            Box::new(move || StdTcpListener::bind(addr.as_str())) as RpcListenerFactory
        };
        let rest = {
            let addr = rest_addr.clone();
            Box::new(move || {
                if rest_enabled {
                    StdTcpListener::bind(addr.as_str()).map(Some)
                } else {
                    Ok(None)
                }
            }) as RestListenerFactory
        };

        Self {
            rpc_endpoint: format!("{RPC_LISTENER} {rpc_addr}"),
            rest_endpoint: format!("{REST_LISTENER} {rest_addr}"),
            rpc,
            rest,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }
}

pub(crate) struct BoundListeners {
    pub rpc: TcpListener,
    pub rest: Option<TcpListener>,
    pub tls: Option<TlsMaterial>,
}

impl BoundListeners {
    pub fn bind(config: ListenerConfig) -> Result<Self, DaemonError> {
        let ListenerConfig {
            rpc_endpoint,
            rest_endpoint,
            rpc,
            rest,
            tls,
        } = config;

        let rpc = rpc()
            .and_then(into_tokio)
            .map_err(|e| bind_error(&rpc_endpoint, e))?;
        // The RPC listener drops here if the gateway fails to bind
        let rest = rest()
            .and_then(|l| l.map(into_tokio).transpose())
            .map_err(|e| bind_error(&rest_endpoint, e))?;

        Ok(Self { rpc, rest, tls })
    }
}

fn into_tokio(listener: StdTcpListener) -> io::Result<TcpListener> {
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

fn bind_error(endpoint: &str, err: io::Error) -> DaemonError {
    DaemonError::ListenerBind {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

/// Address the gateway dials to reach the RPC endpoint
///
/// Wildcard binds are not dialable, so they map to the loopback address of
/// the same family.
pub fn dial_addr(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_addr_rewrites_wildcards() {
        assert_eq!(
            dial_addr("0.0.0.0:11010".parse().unwrap()),
            "127.0.0.1:11010".parse().unwrap()
        );
        assert_eq!(
            dial_addr("[::]:11010".parse().unwrap()),
            "[::1]:11010".parse().unwrap()
        );
        assert_eq!(
            dial_addr("10.0.0.5:11010".parse().unwrap()),
            "10.0.0.5:11010".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_bind_disabled_gateway() {
        let config = ListenerConfig::new(
            Box::new(|| StdTcpListener::bind("127.0.0.1:0")),
            Box::new(|| Ok(None)),
        );

        let bound = BoundListeners::bind(config).unwrap();
        assert!(bound.rest.is_none());
        assert!(bound.rpc.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_bind_failure_names_address() {
        let taken = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let mut config = DaemonConfig::default();
        config.rpc_listen = addr.to_string();
        let err = BoundListeners::bind(ListenerConfig::from_config(&config))
            .err()
            .unwrap();

        match err {
            DaemonError::ListenerBind { endpoint, .. } => {
                assert_eq!(endpoint, format!("RPC listener {addr}"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_from_factory_names_endpoint() {
        let config = ListenerConfig::new(
            Box::new(|| StdTcpListener::bind("127.0.0.1:0")),
            Box::new(|| Err(io::Error::from(io::ErrorKind::AddrInUse))),
        );

        let err = BoundListeners::bind(config).err().unwrap();
        assert!(
            err.to_string().starts_with("unable to bind REST gateway listener: "),
            "{err}"
        );
    }
}
