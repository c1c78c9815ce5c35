pub mod api;
pub mod network;
pub mod swap;

pub use api::*;
pub use network::*;
pub use swap::*;

/// Version reported by the daemon
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Swap protocol version spoken with the server
pub const PROTOCOL_VERSION: u32 = 10;

/// Protocol version advertised when experimental features are enabled
pub const PROTOCOL_VERSION_EXPERIMENTAL: u32 = u32::MAX;

pub fn protocol_version(experimental: bool) -> u32 {
    if experimental {
        PROTOCOL_VERSION_EXPERIMENTAL
    } else {
        PROTOCOL_VERSION
    }
}
