//! JSON gateway in front of the framed RPC endpoint
//!
//! Every API request is forwarded over a fresh RPC connection, so the
//! gateway goes through exactly the same access control as direct callers.
//! The credential token travels in the `Grpc-Metadata-Macaroon` header.

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperConnBuilder;
use loopd_metrics::MetricsCollector;
use loopd_types::methods;
use serde_json::{json, Value};
use std::io;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::accept::AcceptBackoff;
use crate::client::{RpcClient, RpcStream};
use crate::error::{DaemonError, RpcError};
use crate::rpc::{Io, MAX_FRAME_SIZE};

pub const MACAROON_HEADER: &str = "grpc-metadata-macaroon";

#[derive(Clone)]
struct GatewayState {
    client: RpcClient,
    metrics: MetricsCollector,
}

/// Build the gateway routes; `cors_origin` may be empty, `*` or one origin
pub fn router(client: RpcClient, metrics: MetricsCollector, cors_origin: &str) -> Result<Router, DaemonError> {
    let router = Router::new()
        .route("/v1/loop/out", post(loop_out))
        .route("/v1/loop/in", post(loop_in))
        .route("/v1/loop/swaps", get(list_swaps))
        .route("/v1/loop/swap/:id", get(swap_info))
        .route("/v1/loop/info", get(get_info))
        .route("/v1/loop/monitor", get(monitor))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
        .with_state(GatewayState { client, metrics });

    Ok(match cors_layer(cors_origin)? {
        Some(cors) => router.layer(cors),
        None => router,
    })
}

fn cors_layer(origin: &str) -> Result<Option<CorsLayer>, DaemonError> {
    let origin = origin.trim();
    if origin.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        let value = HeaderValue::from_str(origin)
            .map_err(|e| DaemonError::init(format!("invalid CORS origin {origin:?}: {e}")))?;
        AllowOrigin::exact(value)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any),
    ))
}

/// Serve the gateway until `cancel` fires, then drop every connection
pub async fn serve(
    listener: TcpListener,
    router: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(listen = %addr, tls = tls.is_some(), "REST gateway listening");
    }

    let mut connections = JoinSet::new();
    let mut backoff = AcceptBackoff::default();
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => {
                        backoff.reset();
                        accepted
                    }
                    Err(err) => match backoff.on_error(err, "rest", &cancel).await {
                        Ok(()) => continue,
                        Err(err) => break Err(err),
                    },
                };

                let router = router.clone();
                let tls = tls.clone();
                connections.spawn(async move {
                    let io: Box<dyn Io> = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => Box::new(stream),
                            Err(err) => {
                                warn!(%remote_addr, error = %err, "Gateway TLS handshake failed");
                                return;
                            }
                        },
                        None => Box::new(stream),
                    };

                    let hyper_service =
                        service_fn(move |request: Request<Incoming>| router.clone().oneshot(request));

                    if let Err(err) = HyperConnBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(io), hyper_service)
                        .await
                    {
                        debug!(%remote_addr, error = %err, "Gateway connection terminated with error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    connections.abort_all();
    drop(listener);
    while connections.join_next().await.is_some() {}
    debug!("REST gateway stopped");

    result
}

fn macaroon(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MACAROON_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn forward(state: &GatewayState, headers: &HeaderMap, method: &str, payload: Value) -> Response {
    match state.client.call(method, macaroon(headers), payload).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: RpcError) -> Response {
    let (status, code, message) = match err {
        RpcError::Status(status) => (
            StatusCode::from_u16(status.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            status.code.as_str(),
            status.message,
        ),
        other => (StatusCode::BAD_GATEWAY, "unavailable", other.to_string()),
    };
    (status, Json(json!({ "code": code, "message": message }))).into_response()
}

async fn loop_out(State(state): State<GatewayState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    forward(&state, &headers, methods::LOOP_OUT, body).await
}

async fn loop_in(State(state): State<GatewayState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    forward(&state, &headers, methods::LOOP_IN, body).await
}

async fn list_swaps(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    forward(&state, &headers, methods::LIST_SWAPS, json!({})).await
}

async fn swap_info(State(state): State<GatewayState>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    forward(&state, &headers, methods::SWAP_INFO, json!({ "id": id })).await
}

async fn get_info(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    forward(&state, &headers, methods::GET_INFO, json!({})).await
}

/// Newline-delimited JSON, one `{"result": ...}` object per update
async fn monitor(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let stream = match state
        .client
        .subscribe(methods::MONITOR, macaroon(&headers), json!({}))
        .await
    {
        Ok(stream) => stream,
        Err(err) => return error_response(err),
    };

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(ndjson_lines(stream)),
    )
        .into_response()
}

fn ndjson_lines(stream: RpcStream) -> impl futures::Stream<Item = Result<Bytes, RpcError>> + Send {
    futures::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        match stream.message().await {
            Ok(Some(value)) => match serde_json::to_vec(&json!({ "result": value })) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some((Ok(Bytes::from(line)), Some(stream)))
                }
                Err(e) => Some((Err(RpcError::from(e)), None)),
            },
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
}

async fn metrics_handler(State(state): State<GatewayState>) -> Response {
    match state.metrics.export_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_variants() {
        assert!(cors_layer("").unwrap().is_none());
        assert!(cors_layer("*").unwrap().is_some());
        assert!(cors_layer("https://loop.example").unwrap().is_some());
        assert!(cors_layer("bad\norigin").is_err());
    }

    #[test]
    fn test_macaroon_header_lookup() {
        let mut headers = HeaderMap::new();
        assert_eq!(macaroon(&headers), None);

        headers.insert("Grpc-Metadata-Macaroon", HeaderValue::from_static("abcd"));
        assert_eq!(macaroon(&headers).as_deref(), Some("abcd"));
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(RpcError::Status(crate::rpc::RpcStatus::unauthenticated("no")));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = error_response(RpcError::Closed);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
