use futures::StreamExt;
use loopd_auth::{Authorizer, CallContext, CallKind};
use loopd_metrics::{rpc_span, CorrelationId, MetricsCollector};
use loopd_types::MonitorRequest;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::accept::AcceptBackoff;
use crate::error::RpcError;
use crate::rpc::{framed, read_frame, write_frame, Io, RpcCode, RpcFramed, RpcRequest, RpcResponse, RpcStatus};
use crate::service::{decode, SwapClientServer};

/// Framed RPC endpoint
///
/// Every call, unary or streaming, passes the same [`Authorizer`] before a
/// handler runs.
pub struct RpcServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<CallHandler>,
}

struct CallHandler {
    server: Arc<SwapClientServer>,
    authorizer: Arc<dyn Authorizer>,
    metrics: MetricsCollector,
}

impl RpcServer {
    pub fn new(
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        server: Arc<SwapClientServer>,
        authorizer: Arc<dyn Authorizer>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            listener,
            tls,
            handler: Arc::new(CallHandler {
                server,
                authorizer,
                metrics,
            }),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until `cancel` fires
    ///
    /// On cancellation the listener is dropped and every open connection is
    /// aborted, including monitor streams.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        let RpcServer {
            listener,
            tls,
            handler,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!(listen = %addr, tls = tls.is_some(), "RPC server listening");
        }

        let mut connections = JoinSet::new();
        let mut backoff = AcceptBackoff::default();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => {
                            backoff.reset();
                            accepted
                        }
                        Err(err) => match backoff.on_error(err, "rpc", &cancel).await {
                            Ok(()) => continue,
                            Err(err) => break Err(err),
                        },
                    };

                    let handler = handler.clone();
                    let tls = tls.clone();
                    connections.spawn(async move {
                        let io: Box<dyn Io> = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => Box::new(stream),
                                Err(err) => {
                                    warn!(%peer, error = %err, "RPC TLS handshake failed");
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };

                        if let Err(err) = handler.handle(io, peer).await {
                            debug!(%peer, error = %err, "RPC connection ended with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        connections.abort_all();
        drop(listener);
        while connections.join_next().await.is_some() {}
        debug!("RPC server stopped");

        result
    }
}

impl CallHandler {
    async fn handle(&self, io: Box<dyn Io>, peer: SocketAddr) -> Result<(), RpcError> {
        let mut framed = framed(io);
        let Some(request) = read_frame::<RpcRequest>(&mut framed).await? else {
            return Ok(());
        };

        let span = rpc_span(&request.method, CorrelationId::new());
        self.handle_call(&mut framed, request, peer)
            .instrument(span)
            .await
    }

    async fn handle_call(&self, framed: &mut RpcFramed, request: RpcRequest, peer: SocketAddr) -> Result<(), RpcError> {
        let started = Instant::now();
        let RpcRequest {
            method,
            macaroon,
            payload,
        } = request;

        let kind = if SwapClientServer::is_streaming(&method) {
            CallKind::Streaming
        } else {
            CallKind::Unary
        };
        let call = CallContext {
            method: &method,
            macaroon: macaroon.as_deref(),
            peer: Some(peer.ip()),
            kind,
        };

        if let Err(err) = self.authorizer.authorize(&call).await {
            warn!(%peer, error = %err, "Call rejected");
            self.metrics.record_auth_rejection(&method);
            self.metrics
                .record_rpc_call(&method, RpcCode::Unauthenticated.as_str(), started.elapsed());
            let status = RpcStatus::unauthenticated(err.to_string());
            return write_frame(framed, &RpcResponse::from(status)).await;
        }

        match kind {
            CallKind::Unary => {
                let response = match self.server.dispatch(&method, payload).await {
                    Ok(payload) => RpcResponse::Message { payload },
                    Err(status) => RpcResponse::from(status),
                };
                let code = match &response {
                    RpcResponse::Error { code, .. } => code.as_str(),
                    _ => "ok",
                };
                self.metrics.record_rpc_call(&method, code, started.elapsed());
                write_frame(framed, &response).await
            }
            CallKind::Streaming => {
                let result = self.stream_updates(framed, payload).await;
                self.metrics.record_rpc_call(&method, "ok", started.elapsed());
                result
            }
        }
    }

    async fn stream_updates(&self, framed: &mut RpcFramed, payload: serde_json::Value) -> Result<(), RpcError> {
        let request: MonitorRequest = match decode(payload) {
            Ok(request) => request,
            Err(status) => return write_frame(framed, &RpcResponse::from(status)).await,
        };

        let mut subscription = self.server.monitor(request);
        write_frame(framed, &RpcResponse::Accepted).await?;
        debug!(subscriber = subscription.id(), "Monitor stream opened");

        loop {
            tokio::select! {
                update = subscription.recv() => match update {
                    Some(update) => {
                        let payload = serde_json::to_value(&update)?;
                        write_frame(framed, &RpcResponse::Message { payload }).await?;
                    }
                    None => return write_frame(framed, &RpcResponse::End).await,
                },
                // Clients never send after the request; any read means hang-up
                _ = framed.next() => {
                    debug!(subscriber = subscription.id(), "Monitor client went away");
                    return Ok(());
                }
            }
        }
    }
}
