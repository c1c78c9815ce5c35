//! Swap state tracking for the loop swap daemon
//!
//! - [`SwapRegistry`]: every swap known to the current run, keyed by hash
//! - [`StatusBroadcaster`]: fans status updates out to monitor streams
//! - [`WalletBackend`]: the seam to the node and swap server

pub mod backend;
pub mod broadcaster;
pub mod error;
pub mod registry;
pub mod simulated;

pub use backend::{
    migrate_if_needed, BackendConnector, LiquidityManager, NoMigration, StoreMigrator,
    WalletBackend,
};
pub use broadcaster::{forward_status_updates, StatusBroadcaster, Subscription};
pub use error::SwapError;
pub use registry::SwapRegistry;
pub use simulated::{SimulatedBackend, SimulatedConfig, SimulatedConnector, SimulatedLiquidityManager};
