use loopd_config::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::DaemonError;

/// Server and client halves built from one certificate and key
///
/// The client half trusts only the daemon's own certificate and is used by
/// the gateway when it dials back into the RPC endpoint.
#[derive(Clone)]
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl TlsMaterial {
    pub fn load(config: &TlsConfig) -> Result<Self, DaemonError> {
        let certificates = load_certificates(&config.cert_path)?;
        let private_key = load_private_key(&config.key_path)?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|err| DaemonError::init(format!("failed to configure TLS protocol versions: {err}")))?
            .with_no_client_auth()
            .with_single_cert(certificates.clone(), private_key)
            .map_err(|err| DaemonError::init(format!("failed to build TLS server config: {err}")))?;

        let mut roots = RootCertStore::empty();
        for cert in certificates {
            roots
                .add(cert)
                .map_err(|err| DaemonError::init(format!("unusable TLS certificate: {err}")))?;
        }
        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| DaemonError::init(format!("failed to configure TLS protocol versions: {err}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }
}

/// Name the dial-back client verifies the daemon certificate against
pub fn server_name(ip: IpAddr) -> ServerName<'static> {
    ServerName::IpAddress(ip.into())
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, DaemonError> {
    let bytes = fs::read(path)
        .map_err(|err| DaemonError::init(format!("failed to read {path:?}: {err}")))?;
    let mut reader = BufReader::new(bytes.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| DaemonError::init(format!("failed to parse certificates from {path:?}: {err}")))?;

    if certs.is_empty() {
        return Err(DaemonError::init(format!("no certificates found in {path:?}")));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, DaemonError> {
    let bytes = fs::read(path)
        .map_err(|err| DaemonError::init(format!("failed to read {path:?}: {err}")))?;
    let mut reader = BufReader::new(bytes.as_slice());

    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| DaemonError::init(format!("failed to parse private key from {path:?}: {err}")))?
        .ok_or_else(|| DaemonError::init(format!("no valid private key found in {path:?}")))
}
