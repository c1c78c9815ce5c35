//! Loop swap daemon
//!
//! Ties the swap machinery, access control and the two API surfaces
//! together under one lifecycle:
//!
//! - [`Daemon`]: start once, stop once, deliver one result
//! - [`RpcServer`]: framed RPC endpoint, every call authorized
//! - [`gateway`]: JSON over HTTP, dialing back into the RPC endpoint
//! - [`SwapClientServer`]: the API handlers themselves

mod accept;
pub mod client;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod rpc;
pub mod server;
pub mod service;
pub mod tls;

pub use client::{RpcClient, RpcStream};
pub use daemon::{Daemon, ROOT_KEY_DB_TIMEOUT};
pub use error::{DaemonError, RpcError};
pub use gateway::MACAROON_HEADER;
pub use listener::{dial_addr, ListenerConfig, RestListenerFactory, RpcListenerFactory};
pub use rpc::{RpcCode, RpcRequest, RpcResponse, RpcStatus, MAX_FRAME_SIZE};
pub use server::RpcServer;
pub use service::{ServerInfo, SwapClientServer};
pub use tls::TlsMaterial;
