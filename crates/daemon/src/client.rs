use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::RpcError;
use crate::rpc::{framed, read_frame, write_frame, Io, RpcFramed, RpcRequest, RpcResponse, RpcStatus};
use crate::tls::server_name;

/// Client for the framed RPC endpoint; one connection per call
#[derive(Clone)]
pub struct RpcClient {
    addr: SocketAddr,
    tls: Option<TlsConnector>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    pub fn with_tls(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> Result<RpcFramed, RpcError> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;

        let io: Box<dyn Io> = match &self.tls {
            Some(connector) => Box::new(
                connector
                    .connect(server_name(self.addr.ip()), stream)
                    .await
                    .map_err(|e| RpcError::Tls(e.to_string()))?,
            ),
            None => Box::new(stream),
        };
        Ok(framed(io))
    }

    async fn open(&self, method: &str, macaroon: Option<String>, payload: Value) -> Result<RpcFramed, RpcError> {
        let mut framed = self.connect().await?;
        let request = RpcRequest {
            method: method.to_string(),
            macaroon,
            payload,
        };
        write_frame(&mut framed, &request).await?;
        Ok(framed)
    }

    /// Unary call with an untyped payload
    pub async fn call(&self, method: &str, macaroon: Option<String>, payload: Value) -> Result<Value, RpcError> {
        let mut framed = self.open(method, macaroon, payload).await?;

        match read_frame(&mut framed).await? {
            Some(RpcResponse::Message { payload }) => Ok(payload),
            Some(RpcResponse::Error { code, message }) => {
                Err(RpcError::Status(RpcStatus::new(code, message)))
            }
            Some(other) => Err(RpcError::Malformed(format!(
                "unexpected response to unary call: {other:?}"
            ))),
            None => Err(RpcError::Closed),
        }
    }

    pub async fn call_typed<Req, Resp>(&self, method: &str, macaroon: Option<String>, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let response = self.call(method, macaroon, payload).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Open a streaming call; fails if the server rejects it
    pub async fn subscribe(&self, method: &str, macaroon: Option<String>, payload: Value) -> Result<RpcStream, RpcError> {
        let mut framed = self.open(method, macaroon, payload).await?;

        match read_frame(&mut framed).await? {
            Some(RpcResponse::Accepted) => Ok(RpcStream { framed }),
            Some(RpcResponse::Error { code, message }) => {
                Err(RpcError::Status(RpcStatus::new(code, message)))
            }
            Some(other) => Err(RpcError::Malformed(format!(
                "unexpected response to streaming call: {other:?}"
            ))),
            None => Err(RpcError::Closed),
        }
    }
}

/// Messages of an accepted streaming call
pub struct RpcStream {
    framed: RpcFramed,
}

impl RpcStream {
    /// Next message, or `None` once the server ends the stream
    pub async fn message(&mut self) -> Result<Option<Value>, RpcError> {
        match read_frame(&mut self.framed).await? {
            Some(RpcResponse::Message { payload }) => Ok(Some(payload)),
            Some(RpcResponse::End) | None => Ok(None),
            Some(RpcResponse::Error { code, message }) => {
                Err(RpcError::Status(RpcStatus::new(code, message)))
            }
            Some(RpcResponse::Accepted) => Err(RpcError::Malformed("duplicate accept".into())),
        }
    }

    pub async fn message_typed<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        match self.message().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
