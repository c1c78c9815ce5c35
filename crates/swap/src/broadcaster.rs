use loopd_metrics::MetricsCollector;
use loopd_types::SwapInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SwapError;
use crate::registry::SwapRegistry;

/// Fans swap status updates out to a dynamic set of subscribers
///
/// Each subscriber owns a bounded queue. Delivery never blocks: a full
/// queue drops that update for that subscriber only, a closed queue
/// removes the subscriber.
pub struct StatusBroadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<SwapInfo>>>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: MetricsCollector,
}

impl StatusBroadcaster {
    pub fn new(buffer: usize, metrics: MetricsCollector) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
            metrics,
        })
    }

    /// Register a new subscriber; dropping the handle unsubscribes
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, tx);
        }
        self.metrics.subscriber_added();
        debug!(subscriber = id, "Status subscriber added");

        Subscription {
            id,
            receiver: rx,
            broadcaster: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let removed = self
            .subscribers
            .lock()
            .map(|mut subscribers| subscribers.remove(&id).is_some())
            .unwrap_or(false);

        if removed {
            self.metrics.subscriber_removed();
            debug!(subscriber = id, "Status subscriber removed");
        }
    }

    /// Deliver `update` to every current subscriber
    pub fn broadcast(&self, update: &SwapInfo) {
        // Snapshot so subscribe/unsubscribe never wait on delivery
        let snapshot: Vec<(u64, mpsc::Sender<SwapInfo>)> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
            Err(_) => return,
        };

        for (id, tx) in snapshot {
            match tx.try_send(update.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_dropped_update();
                    warn!(
                        subscriber = id,
                        swap = %update.swap_hash,
                        state = %update.state,
                        "Subscriber queue full, dropping status update"
                    );
                }
                Err(TrySendError::Closed(_)) => self.unsubscribe(id),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Receiving side of a status subscription
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<SwapInfo>,
    broadcaster: Weak<StatusBroadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next update, or `None` once the broadcaster is gone
    pub async fn recv(&mut self) -> Option<SwapInfo> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.id);
        }
    }
}

/// Apply backend status updates to the registry and fan them out
///
/// Returns when `cancel` fires or the backend side of the channel closes.
pub async fn forward_status_updates(
    registry: Arc<SwapRegistry>,
    broadcaster: Arc<StatusBroadcaster>,
    mut status_rx: mpsc::Receiver<SwapInfo>,
    metrics: MetricsCollector,
    cancel: CancellationToken,
) -> Result<(), SwapError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            update = status_rx.recv() => {
                let Some(update) = update else {
                    debug!("Status channel closed");
                    return Ok(());
                };

                metrics.record_status_update(update.state);
                debug!(swap = %update.swap_hash, state = %update.state, "Swap status update");

                registry.upsert(update.clone()).await;
                broadcaster.broadcast(&update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopd_types::{SwapHash, SwapState, SwapTerms, SwapType, HASH_SIZE};
    use std::time::Duration;

    fn update(n: u8, state: SwapState) -> SwapInfo {
        let mut swap = SwapInfo::new(
            SwapHash::new([n; HASH_SIZE]),
            SwapType::LoopOut,
            SwapTerms::default(),
        );
        swap.transition(state);
        swap
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let broadcaster = StatusBroadcaster::new(16, MetricsCollector::new());
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        let updates = [
            update(1, SwapState::Initiated),
            update(1, SwapState::PreimageRevealed),
            update(1, SwapState::Success),
        ];
        for u in &updates {
            broadcaster.broadcast(u);
        }

        for sub in [&mut first, &mut second] {
            for expected in &updates {
                assert_eq!(sub.recv().await.as_ref(), Some(expected));
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_isolation() {
        let broadcaster = StatusBroadcaster::new(16, MetricsCollector::new());
        let first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.unsubscribe(first.id());
        broadcaster.broadcast(&update(2, SwapState::Initiated));

        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(
            second.recv().await.map(|s| s.swap_hash),
            Some(SwapHash::new([2; HASH_SIZE]))
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let broadcaster = StatusBroadcaster::new(1, MetricsCollector::new());
        let mut slow = broadcaster.subscribe();

        broadcaster.broadcast(&update(1, SwapState::Initiated));
        broadcaster.broadcast(&update(1, SwapState::Success));

        assert_eq!(slow.recv().await.map(|s| s.state), Some(SwapState::Initiated));
        assert!(slow.receiver.try_recv().is_err());
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let broadcaster = StatusBroadcaster::new(4, MetricsCollector::new());
        let sub = broadcaster.subscribe();
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_removed_on_broadcast() {
        let broadcaster = StatusBroadcaster::new(4, MetricsCollector::new());
        let mut sub = broadcaster.subscribe();
        sub.receiver.close();

        broadcaster.broadcast(&update(1, SwapState::Initiated));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_updates_registry_and_subscribers() {
        let metrics = MetricsCollector::new();
        let registry = Arc::new(SwapRegistry::new(metrics));
        let broadcaster = StatusBroadcaster::new(8, metrics);
        let mut sub = broadcaster.subscribe();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(forward_status_updates(
            registry.clone(),
            broadcaster.clone(),
            rx,
            metrics,
            cancel.clone(),
        ));

        tx.send(update(7, SwapState::HtlcPublished)).await.unwrap();
        assert_eq!(sub.recv().await.map(|s| s.state), Some(SwapState::HtlcPublished));
        assert_eq!(registry.len().await, 1);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_see_every_update_in_order() {
        const UPDATES: usize = 200;
        const QUIT_AFTER: usize = 10;

        let broadcaster = StatusBroadcaster::new(UPDATES, MetricsCollector::new());
        let expected: Vec<SwapHash> = (0..UPDATES)
            .map(|n| SwapHash::new([n as u8; HASH_SIZE]))
            .collect();

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let mut sub = broadcaster.subscribe();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::with_capacity(UPDATES);
                while seen.len() < UPDATES {
                    match sub.recv().await {
                        Some(update) => seen.push(update.swap_hash),
                        None => break,
                    }
                }
                seen
            }));
        }

        let mut quitter = broadcaster.subscribe();
        let quitter = tokio::spawn(async move {
            for _ in 0..QUIT_AFTER {
                quitter.recv().await.unwrap();
            }
            // Dropping the subscription mid-stream unsubscribes
        });

        let (halfway_tx, halfway_rx) = tokio::sync::oneshot::channel();
        let late = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                halfway_rx.await.unwrap();
                let mut sub = broadcaster.subscribe();
                let mut seen = Vec::new();
                while let Ok(Some(update)) =
                    tokio::time::timeout(Duration::from_millis(500), sub.recv()).await
                {
                    seen.push(update.swap_hash);
                }
                seen
            })
        };

        let churn = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let sub = broadcaster.subscribe();
                    tokio::task::yield_now().await;
                    drop(sub);
                }
            })
        };

        let producer = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                let mut halfway_tx = Some(halfway_tx);
                for n in 0..UPDATES {
                    broadcaster.broadcast(&update(n as u8, SwapState::Initiated));
                    if n == UPDATES / 2 {
                        if let Some(tx) = halfway_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        producer.await.unwrap();
        churn.await.unwrap();
        quitter.await.unwrap();

        for consumer in consumers {
            let seen = tokio::time::timeout(Duration::from_secs(5), consumer)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(seen, expected);
        }

        // A late subscriber sees a gap-free tail of the sequence
        let seen = late.await.unwrap();
        let start = expected.len() - seen.len();
        assert_eq!(seen, expected[start..]);

        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
