use async_trait::async_trait;
use chrono::Utc;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::AuthError;
use crate::macaroon::{Caveat, Macaroon};
use crate::permissions::{Permission, PermissionTable};
use crate::store::{RootKeyStore, DEFAULT_ROOT_KEY_ID};

/// How a call reached the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Streaming,
}

/// Everything the access-control check looks at for one call
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub method: &'a str,
    pub macaroon: Option<&'a str>,
    pub peer: Option<IpAddr>,
    pub kind: CallKind,
}

/// Authorization predicate applied to every call before dispatch
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, call: &CallContext<'_>) -> Result<(), AuthError>;
}

pub struct MacaroonServiceConfig {
    pub root_key_store: Arc<dyn RootKeyStore>,
    pub required_permissions: PermissionTable,
    /// Where to write the default admin token on first start
    pub macaroon_path: Option<PathBuf>,
}

/// Issues and validates credential tokens against a permission table
pub struct MacaroonService {
    store: Arc<dyn RootKeyStore>,
    permissions: PermissionTable,
    macaroon_path: Option<PathBuf>,
    running: AtomicBool,
}

impl MacaroonService {
    pub fn new(config: MacaroonServiceConfig) -> Self {
        Self {
            store: config.root_key_store,
            permissions: config.required_permissions,
            macaroon_path: config.macaroon_path,
            running: AtomicBool::new(false),
        }
    }

    /// Create the default root key and write the admin token if missing
    pub async fn start(&self) -> Result<(), AuthError> {
        let root_key = self.store.get_or_create(DEFAULT_ROOT_KEY_ID).await?;

        if let Some(path) = &self.macaroon_path {
            if tokio::fs::try_exists(path).await? {
                debug!(path = %path.display(), "Reusing existing macaroon");
            } else {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let admin = Macaroon::bake(
                    DEFAULT_ROOT_KEY_ID,
                    &root_key,
                    self.permissions.all_permissions(),
                )?;
                tokio::fs::write(path, admin.encode()?).await?;
                info!(path = %path.display(), "Wrote default macaroon");
            }
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop validating; every later call is rejected
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("Macaroon service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn permissions(&self) -> &PermissionTable {
        &self.permissions
    }

    /// Mint a token for `permissions`, optionally attenuated
    pub async fn bake(&self, permissions: Vec<Permission>, caveats: Vec<Caveat>) -> Result<Macaroon, AuthError> {
        let root_key = self.store.get_or_create(DEFAULT_ROOT_KEY_ID).await?;
        let mut macaroon = Macaroon::bake(DEFAULT_ROOT_KEY_ID, &root_key, permissions)?;
        for caveat in caveats {
            macaroon.add_caveat(caveat)?;
        }
        Ok(macaroon)
    }

    /// Check a presented token against the permissions `method` requires
    pub async fn validate(&self, method: &str, token: Option<&str>, peer: Option<IpAddr>) -> Result<(), AuthError> {
        if !self.is_running() {
            return Err(AuthError::unauthorized("macaroon service has not been initialised"));
        }

        let required = self.permissions.required(method).ok_or_else(|| {
            AuthError::unauthorized(format!("unknown permissions required for method {method}"))
        })?;

        let token = token.ok_or_else(|| AuthError::unauthorized("expected 1 macaroon, got 0"))?;
        let macaroon = Macaroon::decode(token)?;

        let root_key = self
            .store
            .get(macaroon.root_key_id())
            .await?
            .ok_or_else(|| AuthError::unauthorized("macaroon root key not found"))?;
        macaroon.verify_signature(&root_key)?;

        if !macaroon.grants(required) {
            let missing: Vec<String> = required
                .iter()
                .filter(|p| !macaroon.permissions().contains(p))
                .map(ToString::to_string)
                .collect();
            return Err(AuthError::unauthorized(format!(
                "permission denied, missing {}",
                missing.join(", ")
            )));
        }

        let now = Utc::now();
        for caveat in macaroon.caveats() {
            caveat.check(peer, now)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Authorizer for MacaroonService {
    async fn authorize(&self, call: &CallContext<'_>) -> Result<(), AuthError> {
        self.validate(call.method, call.macaroon, call.peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::required_permissions;
    use crate::store::InMemoryRootKeyStore;
    use loopd_types::methods;

    fn service(path: Option<PathBuf>) -> MacaroonService {
        MacaroonService::new(MacaroonServiceConfig {
            root_key_store: Arc::new(InMemoryRootKeyStore::new()),
            required_permissions: required_permissions(),
            macaroon_path: path,
        })
    }

    #[tokio::test]
    async fn test_rejects_before_start() {
        let service = service(None);
        let err = service
            .validate(methods::GET_INFO, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not been initialised"));
    }

    #[tokio::test]
    async fn test_start_writes_admin_macaroon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mainnet").join("loop.macaroon");
        let service = service(Some(path.clone()));
        service.start().await.unwrap();

        let token = std::fs::read_to_string(&path).unwrap();
        for method in methods::ALL {
            service.validate(method, Some(token.as_str()), None).await.unwrap();
        }

        // Second start keeps the file as is
        service.start().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), token);
    }

    #[tokio::test]
    async fn test_missing_token_and_unknown_method() {
        let service = service(None);
        service.start().await.unwrap();

        let err = service
            .validate(methods::LIST_SWAPS, None, None)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        let token = service
            .bake(required_permissions().all_permissions(), vec![])
            .await
            .unwrap()
            .encode()
            .unwrap();
        let err = service
            .validate("/looprpc.SwapClient/Nope", Some(token.as_str()), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown permissions"));
    }

    #[tokio::test]
    async fn test_insufficient_permissions() {
        let service = service(None);
        service.start().await.unwrap();

        let readonly = service
            .bake(vec![Permission::new("swap", "read")], vec![])
            .await
            .unwrap()
            .encode()
            .unwrap();

        assert!(service
            .validate(methods::LIST_SWAPS, Some(readonly.as_str()), None)
            .await
            .is_ok());
        let err = service
            .validate(methods::LOOP_OUT, Some(readonly.as_str()), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("swap:execute"));
    }

    #[tokio::test]
    async fn test_foreign_root_key_rejected() {
        let ours = service(None);
        let theirs = service(None);
        ours.start().await.unwrap();
        theirs.start().await.unwrap();

        let token = theirs
            .bake(vec![Permission::new("swap", "read")], vec![])
            .await
            .unwrap()
            .encode()
            .unwrap();
        assert!(ours
            .validate(methods::GET_INFO, Some(token.as_str()), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ip_caveat_enforced() {
        let service = service(None);
        service.start().await.unwrap();

        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let token = service
            .bake(
                vec![Permission::new("swap", "read")],
                vec![Caveat::IpAddr(local)],
            )
            .await
            .unwrap()
            .encode()
            .unwrap();

        assert!(service
            .validate(methods::GET_INFO, Some(token.as_str()), Some(local))
            .await
            .is_ok());
        assert!(service
            .validate(methods::GET_INFO, Some(token.as_str()), Some("10.1.1.1".parse().unwrap()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stop_rejects_further_calls() {
        let service = service(None);
        service.start().await.unwrap();
        let token = service
            .bake(vec![Permission::new("swap", "read")], vec![])
            .await
            .unwrap()
            .encode()
            .unwrap();

        service.stop();
        let call = CallContext {
            method: methods::GET_INFO,
            macaroon: Some(token.as_str()),
            peer: None,
            kind: CallKind::Unary,
        };
        assert!(service.authorize(&call).await.is_err());
    }
}
