use async_trait::async_trait;
use loopd_config::BackendConfig;
use loopd_types::{LoopInRequest, LoopOutRequest, Network, SwapInfo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SwapError;

/// Connection to the wallet node and the swap server
///
/// The daemon drives `run` as a background task. Every swap state change
/// the backend observes is sent on `status_tx`; returning `Err` from `run`
/// is fatal for the daemon.
#[async_trait]
pub trait WalletBackend: Send + Sync {
    /// Swaps persisted by earlier runs
    async fn fetch_swaps(&self) -> Result<Vec<SwapInfo>, SwapError>;

    /// Drive swap execution until `cancel` fires
    async fn run(&self, cancel: CancellationToken, status_tx: mpsc::Sender<SwapInfo>) -> Result<(), SwapError>;

    async fn loop_out(&self, request: LoopOutRequest) -> Result<SwapInfo, SwapError>;

    async fn loop_in(&self, request: LoopInRequest) -> Result<SwapInfo, SwapError>;

    /// Autoloop manager, when the backend supports it
    fn liquidity_manager(&self) -> Option<Arc<dyn LiquidityManager>> {
        None
    }

    /// Release connections; called at most once by the owner
    async fn close(&self);
}

#[async_trait]
pub trait LiquidityManager: Send + Sync {
    /// Run until `cancel` fires; cancellation is a clean return
    async fn run(&self, cancel: CancellationToken) -> Result<(), SwapError>;

    /// Trigger one autoloop pass immediately
    async fn force_autoloop(&self) -> Result<(), SwapError>;
}

/// Opens a [`WalletBackend`] from configuration
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, config: &BackendConfig, network: Network) -> Result<Arc<dyn WalletBackend>, SwapError>;
}

/// One-shot upgrade of the persisted swap store
#[async_trait]
pub trait StoreMigrator: Send + Sync {
    async fn needs_migration(&self) -> Result<bool, SwapError>;

    async fn migrate(&self) -> Result<(), SwapError>;
}

/// Migrator for stores that are already current
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMigration;

#[async_trait]
impl StoreMigrator for NoMigration {
    async fn needs_migration(&self) -> Result<bool, SwapError> {
        Ok(false)
    }

    async fn migrate(&self) -> Result<(), SwapError> {
        Ok(())
    }
}

/// Run the migration if the store reports it needs one
pub async fn migrate_if_needed(migrator: &dyn StoreMigrator) -> Result<bool, SwapError> {
    if !migrator.needs_migration().await? {
        return Ok(false);
    }
    tracing::info!("Migrating swap store");
    migrator.migrate().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct PendingMigration {
        migrated: AtomicBool,
    }

    #[async_trait]
    impl StoreMigrator for PendingMigration {
        async fn needs_migration(&self) -> Result<bool, SwapError> {
            Ok(!self.migrated.load(Ordering::SeqCst))
        }

        async fn migrate(&self) -> Result<(), SwapError> {
            self.migrated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_migrate_if_needed() {
        assert!(!migrate_if_needed(&NoMigration).await.unwrap());

        let pending = PendingMigration {
            migrated: AtomicBool::new(false),
        };
        assert!(migrate_if_needed(&pending).await.unwrap());
        assert!(!migrate_if_needed(&pending).await.unwrap());
    }
}
