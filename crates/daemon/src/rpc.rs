//! Framed RPC wire format
//!
//! Every message is a JSON document inside a 4-byte length-prefixed frame.
//! A connection carries exactly one call: the client writes an
//! [`RpcRequest`], the server answers with one [`RpcResponse::Message`] or
//! [`RpcResponse::Error`] for unary calls. Streaming calls are acknowledged
//! with [`RpcResponse::Accepted`] once authorized, followed by messages and
//! finally [`RpcResponse::End`] or an error.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::RpcError;

/// Largest accepted frame, matching the gRPC receive limit of the daemon
pub const MAX_FRAME_SIZE: usize = 200 * 1024 * 1024;

/// Byte stream an RPC connection runs over, plain TCP or TLS
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type RpcFramed = Framed<Box<dyn Io>, LengthDelimitedCodec>;

pub fn framed(io: Box<dyn Io>) -> RpcFramed {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec();
    Framed::new(io, codec)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fully qualified operation name
    pub method: String,

    /// Hex encoded credential token
    #[serde(default)]
    pub macaroon: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    Message { payload: serde_json::Value },
    Accepted,
    End,
    Error { code: RpcCode, message: String },
}

impl From<RpcStatus> for RpcResponse {
    fn from(status: RpcStatus) -> Self {
        RpcResponse::Error {
            code: status.code,
            message: status.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    InvalidArgument,
    NotFound,
    Unauthenticated,
    Unimplemented,
    Unavailable,
    Internal,
}

impl RpcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcCode::InvalidArgument => "invalid_argument",
            RpcCode::NotFound => "not_found",
            RpcCode::Unauthenticated => "unauthenticated",
            RpcCode::Unimplemented => "unimplemented",
            RpcCode::Unavailable => "unavailable",
            RpcCode::Internal => "internal",
        }
    }

    /// HTTP status used by the gateway
    pub fn http_status(&self) -> u16 {
        match self {
            RpcCode::InvalidArgument => 400,
            RpcCode::Unauthenticated => 401,
            RpcCode::NotFound => 404,
            RpcCode::Internal => 500,
            RpcCode::Unimplemented => 501,
            RpcCode::Unavailable => 503,
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: RpcCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unauthenticated, message)
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(RpcCode::Unimplemented, format!("unknown method {method}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Internal, message)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}

pub async fn write_frame<T: Serialize>(framed: &mut RpcFramed, message: &T) -> Result<(), RpcError> {
    let bytes = serde_json::to_vec(message)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Next frame decoded as `T`, or `None` on a clean end of stream
pub async fn read_frame<T: DeserializeOwned>(framed: &mut RpcFramed) -> Result<Option<T>, RpcError> {
    match framed.next().await {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
        None => Ok(None),
    }
}
