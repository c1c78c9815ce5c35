use loopd_metrics::MetricsCollector;
use loopd_types::{SwapHash, SwapInfo};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory index of every swap known to this run
///
/// Entries are inserted at startup and on new swaps, replaced on status
/// updates, and never removed while the daemon is running.
pub struct SwapRegistry {
    swaps: RwLock<HashMap<SwapHash, SwapInfo>>,
    metrics: MetricsCollector,
}

impl SwapRegistry {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            swaps: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Seed the registry with persisted swaps
    pub async fn load(&self, swaps: Vec<SwapInfo>) {
        let mut map = self.swaps.write().await;
        for swap in swaps {
            map.insert(swap.swap_hash, swap);
        }
        self.metrics.set_swaps_tracked(map.len());
    }

    /// Insert or replace a swap; returns true if it was not known before
    pub async fn upsert(&self, swap: SwapInfo) -> bool {
        let mut map = self.swaps.write().await;
        let is_new = map.insert(swap.swap_hash, swap).is_none();
        if is_new {
            self.metrics.set_swaps_tracked(map.len());
        }
        is_new
    }

    pub async fn get(&self, hash: &SwapHash) -> Option<SwapInfo> {
        self.swaps.read().await.get(hash).cloned()
    }

    /// All swaps, oldest first
    pub async fn list(&self) -> Vec<SwapInfo> {
        let mut swaps: Vec<SwapInfo> = self.swaps.read().await.values().cloned().collect();
        swaps.sort_by(|a, b| {
            a.initiation_time
                .cmp(&b.initiation_time)
                .then_with(|| a.swap_hash.as_bytes().cmp(b.swap_hash.as_bytes()))
        });
        swaps
    }

    pub async fn len(&self) -> usize {
        self.swaps.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.swaps.read().await.is_empty()
    }
}
