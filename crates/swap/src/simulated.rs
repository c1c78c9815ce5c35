//! In-process wallet backend for running the daemon without a node
//!
//! Swaps advance one state per tick along the happy path of their
//! direction. Nothing is persisted across processes.

use async_trait::async_trait;
use loopd_config::BackendConfig;
use loopd_types::{
    LoopInRequest, LoopOutRequest, Network, SwapHash, SwapInfo, SwapPayload, SwapState,
    SwapTerms, SwapType, HASH_SIZE,
};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendConnector, LiquidityManager, WalletBackend};
use crate::error::SwapError;

/// Flat server fee in satoshis
const BASE_SERVER_FEE: u64 = 1_000;

/// Proportional server fee, parts per million
const SERVER_FEE_PPM: u64 = 1_000;

const MIN_SWAP_AMOUNT: u64 = 250_000;
const MAX_SWAP_AMOUNT: u64 = 10_000_000;

const SIMULATED_MINER_FEE: u64 = 2_500;

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub network: Network,
    pub tick: Duration,
    /// Swaps reported as persisted at startup
    pub initial_swaps: Vec<SwapInfo>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            tick: Duration::from_secs(5),
            initial_swaps: Vec::new(),
        }
    }
}

#[derive(Default)]
struct SimState {
    swaps: HashMap<SwapHash, SwapInfo>,
    /// Registered but not yet reported by the run loop; never stepped
    unannounced: HashSet<SwapHash>,
}

pub struct SimulatedBackend {
    config: SimulatedConfig,
    state: Mutex<SimState>,
    new_swaps_tx: mpsc::UnboundedSender<SwapHash>,
    new_swaps_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SwapHash>>,
    liquidity: Arc<SimulatedLiquidityManager>,
    closed: AtomicBool,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        let swaps = config
            .initial_swaps
            .iter()
            .map(|s| (s.swap_hash, s.clone()))
            .collect();
        let (new_swaps_tx, new_swaps_rx) = mpsc::unbounded_channel();

        Self {
            config,
            state: Mutex::new(SimState {
                swaps,
                unannounced: HashSet::new(),
            }),
            new_swaps_tx,
            new_swaps_rx: tokio::sync::Mutex::new(new_swaps_rx),
            liquidity: Arc::new(SimulatedLiquidityManager::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Server fee quoted for `amount`
    pub fn quote(amount: u64) -> u64 {
        BASE_SERVER_FEE + amount.saturating_mul(SERVER_FEE_PPM) / 1_000_000
    }

    fn check_open(&self) -> Result<(), SwapError> {
        if self.is_closed() {
            return Err(SwapError::Closed);
        }
        Ok(())
    }

    fn check_terms(amount: u64, max_swap_fee: u64, max_miner_fee: u64) -> Result<SwapTerms, SwapError> {
        if !(MIN_SWAP_AMOUNT..=MAX_SWAP_AMOUNT).contains(&amount) {
            return Err(SwapError::InvalidRequest(format!(
                "amount {amount} outside [{MIN_SWAP_AMOUNT}, {MAX_SWAP_AMOUNT}]"
            )));
        }

        let server_cost = Self::quote(amount);
        if server_cost > max_swap_fee {
            return Err(SwapError::InvalidRequest(format!(
                "swap fee {server_cost} exceeds maximum {max_swap_fee}"
            )));
        }
        if SIMULATED_MINER_FEE > max_miner_fee {
            return Err(SwapError::InvalidRequest(format!(
                "miner fee {SIMULATED_MINER_FEE} exceeds maximum {max_miner_fee}"
            )));
        }

        Ok(SwapTerms {
            amount,
            server_cost,
            onchain_cost: 0,
            offchain_cost: 0,
            max_swap_fee,
            max_miner_fee,
        })
    }

    fn htlc_address(&self, hash: &SwapHash) -> String {
        let hrp = match self.config.network {
            Network::Mainnet => "bc1q",
            Network::Testnet => "tb1q",
            Network::Regtest | Network::Simnet => "bcrt1q",
        };
        format!("{hrp}{}", &hash.to_hex()[..40])
    }

    fn register(&self, swap_type: SwapType, terms: SwapTerms, mut payload: SwapPayload) -> Result<SwapInfo, SwapError> {
        let mut preimage = [0u8; HASH_SIZE];
        rand::thread_rng().fill_bytes(&mut preimage);
        let hash = SwapHash::from_preimage(&preimage);

        payload.htlc_address = self.htlc_address(&hash);
        let swap = SwapInfo::new(hash, swap_type, terms).with_payload(payload);

        {
            let mut state = self
                .state
                .lock()
                .map_err(|e| SwapError::Backend(e.to_string()))?;
            state.swaps.insert(hash, swap.clone());
            state.unannounced.insert(hash);
        }
        self.new_swaps_tx
            .send(hash)
            .map_err(|_| SwapError::Closed)?;

        info!(swap = %hash, ?swap_type, amount = swap.terms.amount, "Simulated swap initiated");
        Ok(swap)
    }

    /// Mark a new swap as reported and return its current record
    fn announce(&self, hash: SwapHash) -> Result<Vec<SwapInfo>, SwapError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SwapError::Backend(e.to_string()))?;
        state.unannounced.remove(&hash);
        Ok(state.swaps.get(&hash).cloned().into_iter().collect())
    }

    /// Advance every pending swap by one state
    fn step(&self) -> Result<Vec<SwapInfo>, SwapError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SwapError::Backend(e.to_string()))?;
        let SimState { swaps, unannounced } = &mut *state;

        let mut updates = Vec::new();
        for swap in swaps
            .values_mut()
            .filter(|s| !s.state.is_final() && !unannounced.contains(&s.swap_hash))
        {
            let next = next_state(swap.swap_type, swap.state);
            if next == SwapState::Success {
                swap.terms.onchain_cost = SIMULATED_MINER_FEE;
            }
            swap.transition(next);
            updates.push(swap.clone());
        }
        Ok(updates)
    }
}

fn next_state(swap_type: SwapType, state: SwapState) -> SwapState {
    match (swap_type, state) {
        (SwapType::LoopOut, SwapState::Initiated) => SwapState::PreimageRevealed,
        (SwapType::LoopIn, SwapState::Initiated) => SwapState::HtlcPublished,
        (SwapType::LoopIn, SwapState::HtlcPublished) => SwapState::InvoiceSettled,
        _ => SwapState::Success,
    }
}

#[async_trait]
impl WalletBackend for SimulatedBackend {
    async fn fetch_swaps(&self) -> Result<Vec<SwapInfo>, SwapError> {
        self.check_open()?;
        let state = self
            .state
            .lock()
            .map_err(|e| SwapError::Backend(e.to_string()))?;
        Ok(state.swaps.values().cloned().collect())
    }

    async fn run(&self, cancel: CancellationToken, status_tx: mpsc::Sender<SwapInfo>) -> Result<(), SwapError> {
        let mut new_swaps = self.new_swaps_rx.lock().await;
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(network = %self.config.network, "Simulated backend running");

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(hash) = new_swaps.recv() => self.announce(hash)?,
                _ = ticker.tick() => self.step()?,
            };

            for update in updates {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = status_tx.send(update) => {
                        if sent.is_err() {
                            debug!("Status receiver gone, stopping simulated backend");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn loop_out(&self, request: LoopOutRequest) -> Result<SwapInfo, SwapError> {
        self.check_open()?;
        if request.dest.is_empty() {
            return Err(SwapError::InvalidRequest("destination address required".into()));
        }

        let terms = Self::check_terms(request.amount, request.max_swap_fee, request.max_miner_fee)?;
        self.register(
            SwapType::LoopOut,
            terms,
            SwapPayload {
                outgoing_channels: request.outgoing_chan_set,
                label: request.label,
                ..Default::default()
            },
        )
    }

    async fn loop_in(&self, request: LoopInRequest) -> Result<SwapInfo, SwapError> {
        self.check_open()?;
        let terms = Self::check_terms(request.amount, request.max_swap_fee, request.max_miner_fee)?;
        self.register(
            SwapType::LoopIn,
            terms,
            SwapPayload {
                last_hop: request.last_hop,
                label: request.label,
                ..Default::default()
            },
        )
    }

    fn liquidity_manager(&self) -> Option<Arc<dyn LiquidityManager>> {
        Some(self.liquidity.clone())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Simulated backend closed");
        }
    }
}

/// Autoloop stand-in that only counts forced passes
#[derive(Debug, Default)]
pub struct SimulatedLiquidityManager {
    forced: std::sync::atomic::AtomicU64,
}

impl SimulatedLiquidityManager {
    pub fn forced_runs(&self) -> u64 {
        self.forced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiquidityManager for SimulatedLiquidityManager {
    async fn run(&self, cancel: CancellationToken) -> Result<(), SwapError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn force_autoloop(&self) -> Result<(), SwapError> {
        let runs = self.forced.fetch_add(1, Ordering::SeqCst) + 1;
        info!(runs, "Forced autoloop pass, no rules configured");
        Ok(())
    }
}

/// Connector that opens a [`SimulatedBackend`] for the configured network
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    pub tick: Option<Duration>,
}

#[async_trait]
impl BackendConnector for SimulatedConnector {
    async fn connect(&self, config: &BackendConfig, network: Network) -> Result<Arc<dyn WalletBackend>, SwapError> {
        if config.kind != "simulated" {
            return Err(SwapError::Connection(format!(
                "backend kind {} is not available in this build",
                config.kind
            )));
        }

        let mut sim = SimulatedConfig {
            network,
            ..Default::default()
        };
        if let Some(tick) = self.tick {
            sim.tick = tick;
        }
        Ok(Arc::new(SimulatedBackend::new(sim)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_out_request(amount: u64) -> LoopOutRequest {
        LoopOutRequest {
            amount,
            dest: "bcrt1qdest".into(),
            max_swap_fee: SimulatedBackend::quote(amount),
            max_miner_fee: SIMULATED_MINER_FEE,
            ..Default::default()
        }
    }

    fn backend(tick: Duration) -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(SimulatedConfig {
            tick,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_loop_out_validates_terms() {
        let backend = backend(Duration::from_secs(60));

        assert!(matches!(
            backend.loop_out(loop_out_request(1)).await,
            Err(SwapError::InvalidRequest(_))
        ));

        let mut cheap = loop_out_request(500_000);
        cheap.max_swap_fee = 1;
        assert!(backend.loop_out(cheap).await.is_err());

        let swap = backend.loop_out(loop_out_request(500_000)).await.unwrap();
        assert_eq!(swap.state, SwapState::Initiated);
        assert!(swap.payload.htlc_address.starts_with("bcrt1q"));
        assert_eq!(backend.fetch_swaps().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_reports_progress_until_success() {
        let backend = backend(Duration::from_millis(10));
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let runner = {
            let backend = backend.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { backend.run(cancel, tx).await })
        };

        let swap = backend
            .loop_in(LoopInRequest {
                amount: 300_000,
                max_swap_fee: SimulatedBackend::quote(300_000),
                max_miner_fee: SIMULATED_MINER_FEE,
                ..Default::default()
            })
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(update) = rx.recv().await {
            assert_eq!(update.swap_hash, swap.swap_hash);
            seen.push(update.state);
            if update.state.is_final() {
                break;
            }
        }
        assert_eq!(seen.first(), Some(&SwapState::Initiated));
        assert_eq!(seen.last(), Some(&SwapState::Success));

        cancel.cancel();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_calls() {
        let backend = backend(Duration::from_secs(60));
        backend.close().await;

        assert!(backend.is_closed());
        assert!(matches!(backend.fetch_swaps().await, Err(SwapError::Closed)));
    }

    #[tokio::test]
    async fn test_connector_rejects_unknown_kind() {
        let connector = SimulatedConnector::default();
        let mut config = BackendConfig::default();
        assert!(connector.connect(&config, Network::Regtest).await.is_ok());

        config.kind = "lnd".into();
        assert!(connector.connect(&config, Network::Regtest).await.is_err());
    }

    #[tokio::test]
    async fn test_liquidity_manager_stops_on_cancel() {
        let manager = SimulatedLiquidityManager::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(manager.run(cancel).await.is_ok());
        manager.force_autoloop().await.unwrap();
        assert_eq!(manager.forced_runs(), 1);
    }
}
