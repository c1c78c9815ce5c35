use async_trait::async_trait;
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::error::StoreError;

pub const ROOT_KEY_LEN: usize = 32;

/// Identifier of the root key used for daemon-issued tokens
pub const DEFAULT_ROOT_KEY_ID: &str = "0";

/// Secret key that anchors a token's signature chain
#[derive(Clone, PartialEq, Eq)]
pub struct RootKey([u8; ROOT_KEY_LEN]);

impl RootKey {
    pub fn generate() -> Self {
        let mut key = [0u8; ROOT_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        let key: [u8; ROOT_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| StoreError::InvalidKey(format!("expected {ROOT_KEY_LEN} bytes, got {}", bytes.len())))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootKey(..)")
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// Persistent storage for root keys
#[async_trait]
pub trait RootKeyStore: Send + Sync {
    /// Look up a root key by id
    async fn get(&self, id: &str) -> Result<Option<RootKey>, StoreError>;

    /// Return the root key for `id`, creating it if absent
    async fn get_or_create(&self, id: &str) -> Result<RootKey, StoreError>;

    /// Release the store's handles; further calls fail with `Closed`
    async fn close(&self);
}

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryRootKeyStore {
    keys: Mutex<HashMap<String, RootKey>>,
    closed: AtomicBool,
}

impl InMemoryRootKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RootKeyStore for InMemoryRootKeyStore {
    async fn get(&self, id: &str) -> Result<Option<RootKey>, StoreError> {
        self.check_open()?;
        let keys = self
            .keys
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(keys.get(id).cloned())
    }

    async fn get_or_create(&self, id: &str) -> Result<RootKey, StoreError> {
        self.check_open()?;
        let mut keys = self
            .keys
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(keys
            .entry(id.to_string())
            .or_insert_with(RootKey::generate)
            .clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SQLITE STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Root key store backed by a single SQLite file
///
/// The single connection runs in exclusive locking mode and writes to the
/// file while opening, so it holds the exclusive file lock from `open` until
/// `close`. A second daemon pointed at the same data directory fails to open
/// the store with [`StoreError::Locked`] once `busy_timeout` elapses.
pub struct SqliteRootKeyStore {
    pool: SqlitePool,
    exclusive: bool,
}

impl SqliteRootKeyStore {
    pub async fn open<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(busy_timeout);

        // The lock lives on the connection, so it must never be recycled
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self {
            pool,
            exclusive: true,
        };
        if let Err(err) = store.acquire_exclusive().await {
            store.pool.close().await;
            return Err(err);
        }

        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing)
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let store = Self {
            pool,
            exclusive: false,
        };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Migrate and then write, so the exclusive lock is taken even when the
    /// database already exists and the migrations are no-ops
    async fn acquire_exclusive(&self) -> Result<(), StoreError> {
        self.run_migrations().await?;

        sqlx::query("INSERT OR REPLACE INTO store_owner (id, opened_at) VALUES (0, ?)")
            .bind(chrono::Utc::now().timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    /// Drop back to normal locking; the lock is released on the next access
    async fn release_exclusive(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA locking_mode = NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("SELECT COUNT(*) FROM root_keys")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(include_str!("../migrations/001_create_root_keys.sql"))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(include_str!("../migrations/002_create_store_owner.sql"))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl RootKeyStore for SqliteRootKeyStore {
    async fn get(&self, id: &str) -> Result<Option<RootKey>, StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }

        let row = sqlx::query("SELECT root_key FROM root_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(|row| RootKey::from_slice(&row.get::<Vec<u8>, _>("root_key")))
            .transpose()
    }

    async fn get_or_create(&self, id: &str) -> Result<RootKey, StoreError> {
        if let Some(key) = self.get(id).await? {
            return Ok(key);
        }

        let key = RootKey::generate();
        sqlx::query("INSERT OR IGNORE INTO root_keys (id, root_key, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(key.as_bytes().to_vec())
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        // A concurrent insert may have won; return whatever is stored
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::DatabaseError(format!("root key {id} missing after insert")))
    }

    /// Releases the file lock before returning, so a restarted daemon can
    /// open the same file right away
    async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        if self.exclusive {
            if let Err(err) = self.release_exclusive().await {
                warn!(error = %err, "Unable to release root key database lock");
            }
        }
        self.pool.close().await;
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if is_locked(db.code().as_deref(), db.message()) => {
            StoreError::Locked
        }
        sqlx::Error::PoolClosed => StoreError::Closed,
        _ => StoreError::DatabaseError(err.to_string()),
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) both mean another holder
fn is_locked(code: Option<&str>, message: &str) -> bool {
    matches!(code, Some("5") | Some("6")) || message.contains("database is locked")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_get_or_create_is_stable() {
        let store = InMemoryRootKeyStore::new();

        assert!(store.get("0").await.unwrap().is_none());
        let first = store.get_or_create("0").await.unwrap();
        let second = store.get_or_create("0").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get("0").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_in_memory_close() {
        let store = InMemoryRootKeyStore::new();
        store.close().await;

        assert!(store.is_closed());
        assert!(matches!(store.get("0").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_sqlite_in_memory_roundtrip() {
        let store = SqliteRootKeyStore::in_memory().await.unwrap();

        let key = store.get_or_create(DEFAULT_ROOT_KEY_ID).await.unwrap();
        assert_eq!(store.get(DEFAULT_ROOT_KEY_ID).await.unwrap(), Some(key.clone()));
        assert_eq!(store.get_or_create(DEFAULT_ROOT_KEY_ID).await.unwrap(), key);
        assert!(store.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_file_persists_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macaroons.db");

        let store = SqliteRootKeyStore::open(&path, Duration::from_secs(1))
            .await
            .unwrap();
        let key = store.get_or_create(DEFAULT_ROOT_KEY_ID).await.unwrap();
        store.close().await;

        assert!(matches!(store.get(DEFAULT_ROOT_KEY_ID).await, Err(StoreError::Closed)));

        let reopened = SqliteRootKeyStore::open(&path, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reopened.get(DEFAULT_ROOT_KEY_ID).await.unwrap(), Some(key));
    }

    #[tokio::test]
    async fn test_sqlite_existing_file_is_locked_by_first_opener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macaroons.db");

        let setup = SqliteRootKeyStore::open(&path, Duration::from_secs(1))
            .await
            .unwrap();
        setup.get_or_create(DEFAULT_ROOT_KEY_ID).await.unwrap();
        setup.close().await;

        // Only reads after the file exists, but the lock is still held
        let first = SqliteRootKeyStore::open(&path, Duration::from_millis(200))
            .await
            .unwrap();
        first.get_or_create(DEFAULT_ROOT_KEY_ID).await.unwrap();

        let second = SqliteRootKeyStore::open(&path, Duration::from_millis(200)).await;
        assert!(matches!(second, Err(StoreError::Locked)), "{:?}", second.err());

        first.close().await;
    }

    #[tokio::test]
    async fn test_sqlite_reopen_right_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macaroons.db");

        let mut expected = None;
        for _ in 0..5 {
            let store = SqliteRootKeyStore::open(&path, Duration::from_millis(100))
                .await
                .unwrap();
            let key = store.get_or_create(DEFAULT_ROOT_KEY_ID).await.unwrap();
            assert_eq!(*expected.get_or_insert_with(|| key.clone()), key);
            store.close().await;
        }
    }

    #[test]
    fn test_locked_detection() {
        assert!(is_locked(Some("5"), "database is busy"));
        assert!(is_locked(None, "database is locked"));
        assert!(!is_locked(Some("1"), "syntax error"));
    }

    #[test]
    fn test_root_key_debug_is_redacted() {
        let key = RootKey::generate();
        assert_eq!(format!("{key:?}"), "RootKey(..)");
        assert!(RootKey::from_slice(&[0u8; 3]).is_err());
    }
}
