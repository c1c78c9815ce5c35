use loopd_metrics::MetricsCollector;
use loopd_swap::{StatusBroadcaster, Subscription, SwapError, SwapRegistry, WalletBackend};
use loopd_types::{
    methods, GetInfoRequest, GetInfoResponse, ListSwapsRequest, ListSwapsResponse, LoopInRequest,
    LoopOutRequest, MonitorRequest, Network, SwapInfo, SwapInfoRequest, SwapResponse, SwapStats,
    SwapType, DAEMON_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::rpc::RpcStatus;

/// Static facts reported by `GetInfo`
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub network: Network,
    pub rpc_listen: String,
    pub rest_listen: String,
    pub macaroon_path: String,
}

/// Handlers of the swap client API
///
/// Transport independent: the framed RPC server decodes requests and calls
/// in here, and a host process running the daemon as a subserver can do
/// the same.
pub struct SwapClientServer {
    backend: Arc<dyn WalletBackend>,
    registry: Arc<SwapRegistry>,
    broadcaster: Arc<StatusBroadcaster>,
    metrics: MetricsCollector,
    info: ServerInfo,
}

impl SwapClientServer {
    pub fn new(
        backend: Arc<dyn WalletBackend>,
        registry: Arc<SwapRegistry>,
        broadcaster: Arc<StatusBroadcaster>,
        metrics: MetricsCollector,
        info: ServerInfo,
    ) -> Self {
        Self {
            backend,
            registry,
            broadcaster,
            metrics,
            info,
        }
    }

    pub fn is_streaming(method: &str) -> bool {
        method == methods::MONITOR
    }

    pub async fn loop_out(&self, request: LoopOutRequest) -> Result<SwapResponse, RpcStatus> {
        info!(amount = request.amount, dest = %request.dest, "Loop out request received");
        let swap = self.backend.loop_out(request).await.map_err(swap_status)?;
        self.metrics.record_swap_initiated(SwapType::LoopOut);
        Ok(SwapResponse::from(&swap))
    }

    pub async fn loop_in(&self, request: LoopInRequest) -> Result<SwapResponse, RpcStatus> {
        info!(amount = request.amount, "Loop in request received");
        let swap = self.backend.loop_in(request).await.map_err(swap_status)?;
        self.metrics.record_swap_initiated(SwapType::LoopIn);
        Ok(SwapResponse::from(&swap))
    }

    /// Stream of status updates; dropping it unsubscribes
    pub fn monitor(&self, _request: MonitorRequest) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub async fn list_swaps(&self, _request: ListSwapsRequest) -> Result<ListSwapsResponse, RpcStatus> {
        Ok(ListSwapsResponse {
            swaps: self.registry.list().await,
        })
    }

    pub async fn swap_info(&self, request: SwapInfoRequest) -> Result<SwapInfo, RpcStatus> {
        self.registry
            .get(&request.id)
            .await
            .ok_or_else(|| RpcStatus::not_found(format!("swap with hash {} not found", request.id)))
    }

    pub async fn get_info(&self, _request: GetInfoRequest) -> Result<GetInfoResponse, RpcStatus> {
        let swaps = self.registry.list().await;
        Ok(GetInfoResponse {
            version: DAEMON_VERSION.to_string(),
            network: self.info.network,
            rpc_listen: self.info.rpc_listen.clone(),
            rest_listen: self.info.rest_listen.clone(),
            macaroon_path: self.info.macaroon_path.clone(),
            loop_out_stats: SwapStats::collect(SwapType::LoopOut, &swaps),
            loop_in_stats: SwapStats::collect(SwapType::LoopIn, &swaps),
        })
    }

    #[cfg(feature = "debug")]
    pub async fn force_autoloop(&self) -> Result<(), RpcStatus> {
        let manager = self
            .backend
            .liquidity_manager()
            .ok_or_else(|| RpcStatus::new(crate::rpc::RpcCode::Unavailable, "liquidity manager not available"))?;
        manager.force_autoloop().await.map_err(swap_status)
    }

    /// Decode, run and encode a unary call
    pub async fn dispatch(&self, method: &str, payload: Value) -> Result<Value, RpcStatus> {
        match method {
            methods::LOOP_OUT => encode(self.loop_out(decode(payload)?).await?),
            methods::LOOP_IN => encode(self.loop_in(decode(payload)?).await?),
            methods::LIST_SWAPS => encode(self.list_swaps(decode(payload)?).await?),
            methods::SWAP_INFO => encode(self.swap_info(decode(payload)?).await?),
            methods::GET_INFO => encode(self.get_info(decode(payload)?).await?),
            #[cfg(feature = "debug")]
            methods::FORCE_AUTOLOOP => encode(self.force_autoloop().await?),
            other => Err(RpcStatus::unimplemented(other)),
        }
    }
}

/// Null payloads decode as the empty request
pub(crate) fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, RpcStatus> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| RpcStatus::invalid_argument(e.to_string()))
}

fn encode<T: Serialize>(response: T) -> Result<Value, RpcStatus> {
    serde_json::to_value(response).map_err(|e| RpcStatus::internal(e.to_string()))
}

fn swap_status(err: SwapError) -> RpcStatus {
    match err {
        SwapError::InvalidRequest(msg) => RpcStatus::invalid_argument(msg),
        SwapError::NotFound(hash) => RpcStatus::not_found(format!("swap with hash {hash} not found")),
        SwapError::Closed => RpcStatus::new(crate::rpc::RpcCode::Unavailable, "backend is shutting down"),
        other => RpcStatus::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcCode;
    use loopd_swap::{SimulatedBackend, SimulatedConfig};
    use loopd_types::{SwapHash, SwapTerms, HASH_SIZE};
    use serde_json::json;

    async fn server(initial: Vec<SwapInfo>) -> SwapClientServer {
        let metrics = MetricsCollector::new();
        let registry = Arc::new(SwapRegistry::new(metrics));
        registry.load(initial).await;

        SwapClientServer::new(
            Arc::new(SimulatedBackend::new(SimulatedConfig::default())),
            registry,
            StatusBroadcaster::new(8, metrics),
            metrics,
            ServerInfo {
                network: Network::Regtest,
                rpc_listen: "127.0.0.1:11010".into(),
                rest_listen: "127.0.0.1:8081".into(),
                macaroon_path: "/tmp/loop.macaroon".into(),
            },
        )
    }

    fn fixture(n: u8) -> SwapInfo {
        SwapInfo::new(
            SwapHash::new([n; HASH_SIZE]),
            SwapType::LoopOut,
            SwapTerms {
                amount: 250_000,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_dispatch_list_and_info() {
        let server = server(vec![fixture(1), fixture(2)]).await;

        let listed: ListSwapsResponse =
            serde_json::from_value(server.dispatch(methods::LIST_SWAPS, Value::Null).await.unwrap()).unwrap();
        assert_eq!(listed.swaps.len(), 2);

        let info: SwapInfo = serde_json::from_value(
            server
                .dispatch(methods::SWAP_INFO, json!({"id": SwapHash::new([2; HASH_SIZE]).to_hex()}))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(info.swap_hash, SwapHash::new([2; HASH_SIZE]));

        let missing = server
            .dispatch(methods::SWAP_INFO, json!({"id": SwapHash::new([9; HASH_SIZE]).to_hex()}))
            .await
            .unwrap_err();
        assert_eq!(missing.code, RpcCode::NotFound);
    }

    #[tokio::test]
    async fn test_dispatch_get_info_counts_pending() {
        let server = server(vec![fixture(1)]).await;
        let info: GetInfoResponse =
            serde_json::from_value(server.dispatch(methods::GET_INFO, json!({})).await.unwrap()).unwrap();

        assert_eq!(info.network, Network::Regtest);
        assert_eq!(info.loop_out_stats.pending_count, 1);
        assert_eq!(info.version, DAEMON_VERSION);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_input() {
        let server = server(vec![]).await;

        let err = server
            .dispatch(methods::LOOP_OUT, json!({"amount": "lots"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcCode::InvalidArgument);

        let err = server
            .dispatch(methods::LOOP_OUT, json!({"amount": 1, "dest": "x", "max_swap_fee": 0, "max_miner_fee": 0}))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcCode::InvalidArgument);

        let err = server.dispatch("/looprpc.SwapClient/Nope", Value::Null).await.unwrap_err();
        assert_eq!(err.code, RpcCode::Unimplemented);
    }

    #[tokio::test]
    async fn test_monitor_is_streaming() {
        assert!(SwapClientServer::is_streaming(methods::MONITOR));
        assert!(!SwapClientServer::is_streaming(methods::LIST_SWAPS));

        let server = server(vec![]).await;
        let sub = server.monitor(MonitorRequest {});
        assert_eq!(server.broadcaster.subscriber_count(), 1);
        drop(sub);
        assert_eq!(server.broadcaster.subscriber_count(), 0);
    }
}
