//! Request and response bodies of the swap client API
//!
//! Field names are the wire names on both the framed RPC endpoint and the
//! JSON gateway. Every field is always emitted, including empty ones.

use serde::{Deserialize, Serialize};

use crate::{Network, SwapHash, SwapInfo, SwapState, SwapType};

/// Fully qualified operation names
pub mod methods {
    pub const LOOP_OUT: &str = "/looprpc.SwapClient/LoopOut";
    pub const LOOP_IN: &str = "/looprpc.SwapClient/LoopIn";
    pub const MONITOR: &str = "/looprpc.SwapClient/Monitor";
    pub const LIST_SWAPS: &str = "/looprpc.SwapClient/ListSwaps";
    pub const SWAP_INFO: &str = "/looprpc.SwapClient/SwapInfo";
    pub const GET_INFO: &str = "/looprpc.SwapClient/GetInfo";

    /// Every operation served by the swap client
    pub const ALL: &[&str] = &[LOOP_OUT, LOOP_IN, MONITOR, LIST_SWAPS, SWAP_INFO, GET_INFO];

    /// Only served by builds with the `debug` feature
    pub const FORCE_AUTOLOOP: &str = "/looprpc.Debug/ForceAutoLoop";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoopOutRequest {
    pub amount: u64,
    pub dest: String,
    pub max_swap_fee: u64,
    pub max_miner_fee: u64,
    #[serde(default)]
    pub outgoing_chan_set: Vec<u64>,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoopInRequest {
    pub amount: u64,
    pub max_swap_fee: u64,
    pub max_miner_fee: u64,
    #[serde(default)]
    pub last_hop: Option<String>,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapResponse {
    pub id: SwapHash,
    pub htlc_address: String,
    pub server_message: String,
}

impl From<&SwapInfo> for SwapResponse {
    fn from(swap: &SwapInfo) -> Self {
        Self {
            id: swap.swap_hash,
            htlc_address: swap.payload.htlc_address.clone(),
            server_message: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MonitorRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListSwapsRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListSwapsResponse {
    pub swaps: Vec<SwapInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInfoRequest {
    pub id: SwapHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetInfoRequest {}

/// Per-direction swap counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SwapStats {
    pub pending_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub sum_succeeded_amt: u64,
    pub sum_succeeded_cost: u64,
}

impl SwapStats {
    /// Aggregate counters for all swaps of the given direction
    pub fn collect<'a>(swap_type: SwapType, swaps: impl IntoIterator<Item = &'a SwapInfo>) -> Self {
        let mut stats = SwapStats::default();
        for swap in swaps.into_iter().filter(|s| s.swap_type == swap_type) {
            match swap.state {
                SwapState::Success => {
                    stats.success_count += 1;
                    stats.sum_succeeded_amt += swap.terms.amount;
                    stats.sum_succeeded_cost += swap.terms.total_cost();
                }
                SwapState::Failed => stats.fail_count += 1,
                _ => stats.pending_count += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetInfoResponse {
    pub version: String,
    pub network: Network,
    pub rpc_listen: String,
    pub rest_listen: String,
    pub macaroon_path: String,
    pub loop_out_stats: SwapStats,
    pub loop_in_stats: SwapStats,
}
