//! Access control for the loop swap daemon
//!
//! Calls present a hex-encoded macaroon: a bearer token carrying a set of
//! permissions and first-party caveats, signed with an HMAC chain rooted in
//! a key kept in the [`RootKeyStore`]. The [`MacaroonService`] checks the
//! token against a [`PermissionTable`] that maps every operation to the
//! permissions it needs.

pub mod error;
pub mod macaroon;
pub mod permissions;
pub mod service;
pub mod store;

pub use error::{AuthError, StoreError};
pub use macaroon::{Caveat, Macaroon};
pub use permissions::{required_permissions, Permission, PermissionTable};
#[cfg(feature = "debug")]
pub use permissions::debug_permissions;
pub use service::{Authorizer, CallContext, CallKind, MacaroonService, MacaroonServiceConfig};
pub use store::{InMemoryRootKeyStore, RootKey, RootKeyStore, SqliteRootKeyStore, DEFAULT_ROOT_KEY_ID};
