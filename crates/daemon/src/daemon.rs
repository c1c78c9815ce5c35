//! Lifecycle of the swap daemon
//!
//! A [`Daemon`] starts at most once, in one of two modes:
//!
//! - standalone: it connects its own backend, binds the RPC endpoint and the
//!   REST gateway and serves until stopped
//! - subserver: a host process hands in the backend and does its own
//!   serving; the daemon only runs the swap machinery and, optionally, the
//!   macaroon service
//!
//! Every resource is opened before the first background task is spawned, so
//! a failed start returns an error and leaves nothing running. Once started,
//! the first task failure or a [`Daemon::stop`] call tears everything down,
//! and the outcome is delivered exactly once through [`Daemon::wait`].

use axum::Router;
use loopd_auth::{
    required_permissions, AuthError, Authorizer, MacaroonService, MacaroonServiceConfig,
    PermissionTable, RootKeyStore, SqliteRootKeyStore, StoreError,
};
use loopd_config::{validate_config, DaemonConfig};
use loopd_metrics::MetricsCollector;
use loopd_swap::{
    forward_status_updates, migrate_if_needed, BackendConnector, NoMigration, SimulatedConnector,
    StatusBroadcaster, StoreMigrator, SwapRegistry, WalletBackend,
};
use loopd_types::{protocol_version, DAEMON_VERSION};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::client::RpcClient;
use crate::error::DaemonError;
use crate::gateway;
use crate::listener::{dial_addr, BoundListeners, ListenerConfig};
use crate::server::RpcServer;
use crate::service::{ServerInfo, SwapClientServer};
use crate::tls::TlsMaterial;

/// How long to wait for the lock on the root key database
pub const ROOT_KEY_DB_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_BACKEND: &str = "backend";
const TASK_STATUS: &str = "status-forwarder";
const TASK_LIQUIDITY: &str = "liquidity-manager";
const TASK_RPC: &str = "rpc-server";
const TASK_REST: &str = "rest-gateway";

type DaemonResult = Result<(), DaemonError>;

enum Mode {
    Standalone,
    Subserver { with_macaroons: bool },
}

// ═══════════════════════════════════════════════════════════════════════════
// DAEMON
// ═══════════════════════════════════════════════════════════════════════════

/// The swap daemon
pub struct Daemon {
    config: DaemonConfig,
    listeners: Mutex<Option<ListenerConfig>>,
    connector: Arc<dyn BackendConnector>,
    migrator: Arc<dyn StoreMigrator>,
    root_key_store: Option<Arc<dyn RootKeyStore>>,
    metrics: MetricsCollector,

    started: AtomicBool,
    stop_requested: AtomicBool,
    quit: CancellationToken,
    result_tx: Mutex<Option<oneshot::Sender<DaemonResult>>>,
    result_rx: Mutex<Option<oneshot::Receiver<DaemonResult>>>,
    running: OnceLock<Running>,
}

/// Handles published once startup succeeded
struct Running {
    server: Arc<SwapClientServer>,
    macaroons: Option<Arc<MacaroonService>>,
    rpc_addr: Option<SocketAddr>,
    rest_addr: Option<SocketAddr>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, listeners: ListenerConfig) -> Self {
        let (result_tx, result_rx) = oneshot::channel();
        Self {
            config,
            listeners: Mutex::new(Some(listeners)),
            connector: Arc::new(SimulatedConnector::default()),
            migrator: Arc::new(NoMigration),
            root_key_store: None,
            metrics: MetricsCollector::new(),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            quit: CancellationToken::new(),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            running: OnceLock::new(),
        }
    }

    /// Listen on the addresses named in the configuration
    pub fn from_config(config: DaemonConfig) -> Self {
        let listeners = ListenerConfig::from_config(&config);
        Self::new(config, listeners)
    }

    pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_migrator(mut self, migrator: Arc<dyn StoreMigrator>) -> Self {
        self.migrator = migrator;
        self
    }

    /// Use `store` instead of the root key database under the data dir
    pub fn with_root_key_store(mut self, store: Arc<dyn RootKeyStore>) -> Self {
        self.root_key_store = Some(store);
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics
    }

    /// Start as a standalone daemon
    ///
    /// Connects the backend, binds both listeners and returns once every
    /// background task is running. A second call fails with
    /// [`DaemonError::AlreadyStarted`], whatever the first call returned.
    pub async fn start(&self) -> DaemonResult {
        let result_tx = self.claim_start()?;
        self.check_config()?;

        let backend = self
            .connector
            .connect(&self.config.backend, self.config.network)
            .await
            .map_err(|e| DaemonError::init(format!("unable to connect to backend: {e}")))?;

        self.launch(backend, true, Mode::Standalone, result_tx).await
    }

    /// Start inside a host process that owns `backend` and the transport
    ///
    /// No listener is bound and the backend is left open on shutdown.
    pub async fn start_as_subserver(
        &self,
        backend: Arc<dyn WalletBackend>,
        with_macaroon_service: bool,
    ) -> DaemonResult {
        let result_tx = self.claim_start()?;
        self.check_config()?;

        let mode = Mode::Subserver {
            with_macaroons: with_macaroon_service,
        };
        self.launch(backend, false, mode, result_tx).await
    }

    /// Request shutdown; safe to call any number of times from anywhere
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("Daemon stop requested");
            self.quit.cancel();
        }
    }

    /// Wait for the daemon to finish
    ///
    /// Returns `Ok` after a requested stop and the first task error
    /// otherwise. Only one caller receives the result; any other call, or a
    /// call after a failed start, yields [`DaemonError::NotRunning`].
    pub async fn wait(&self) -> DaemonResult {
        let result_rx = self
            .result_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(DaemonError::NotRunning)?;

        result_rx.await.unwrap_or(Err(DaemonError::NotRunning))
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.running.get().and_then(|r| r.rpc_addr)
    }

    pub fn rest_addr(&self) -> Option<SocketAddr> {
        self.running.get().and_then(|r| r.rest_addr)
    }

    /// API handlers, for hosts serving the daemon as a subserver
    pub fn swap_server(&self) -> Option<Arc<SwapClientServer>> {
        self.running.get().map(|r| r.server.clone())
    }

    /// Check a caller's token for `method`
    pub async fn validate_macaroon(
        &self,
        method: &str,
        macaroon: Option<&str>,
        peer: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        match self.running.get().and_then(|r| r.macaroons.as_ref()) {
            Some(service) => service.validate(method, macaroon, peer).await,
            None => Err(AuthError::unauthorized(
                "macaroon service has not been initialised",
            )),
        }
    }

    fn claim_start(&self) -> Result<oneshot::Sender<DaemonResult>, DaemonError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaemonError::AlreadyStarted);
        }

        self.result_tx
            .lock()
            .ok()
            .and_then(|mut tx| tx.take())
            .ok_or(DaemonError::AlreadyStarted)
    }

    fn check_config(&self) -> DaemonResult {
        validate_config(&self.config).map_err(|e| DaemonError::init(e.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STARTUP
    // ═══════════════════════════════════════════════════════════════════════════

    async fn launch(
        &self,
        backend: Arc<dyn WalletBackend>,
        owns_backend: bool,
        mode: Mode,
        result_tx: oneshot::Sender<DaemonResult>,
    ) -> DaemonResult {
        info!(
            version = DAEMON_VERSION,
            network = %self.config.network,
            subserver = matches!(mode, Mode::Subserver { .. }),
            "Starting loop daemon"
        );

        let mut opened = OpenedResources {
            backend: owns_backend.then(|| backend.clone()),
            ..Default::default()
        };

        match self.initialize(backend, &mode, &mut opened).await {
            Ok(prepared) => {
                self.spawn_tasks(prepared, opened, result_tx);
                info!("Loop daemon started");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Daemon startup failed");
                opened.close().await;
                Err(err)
            }
        }
    }

    async fn initialize(
        &self,
        backend: Arc<dyn WalletBackend>,
        mode: &Mode,
        opened: &mut OpenedResources,
    ) -> Result<Prepared, DaemonError> {
        let config = &self.config;

        if config.enable_experimental {
            warn!("Experimental protocol features enabled");
        }
        info!(
            protocol_version = protocol_version(config.enable_experimental),
            "Swap protocol version"
        );
        if let Some(host) = config.swap_server_host() {
            info!(server = %host, no_tls = config.server.no_tls, "Swap server address");
        }

        migrate_if_needed(self.migrator.as_ref())
            .await
            .map_err(|e| DaemonError::init(format!("unable to migrate swap store: {e}")))?;

        let swaps = backend
            .fetch_swaps()
            .await
            .map_err(|e| DaemonError::init(format!("unable to fetch existing swaps: {e}")))?;
        let registry = Arc::new(SwapRegistry::new(self.metrics));
        registry.load(swaps).await;
        let swaps = registry.len().await;
        info!(swaps, "Loaded existing swaps");

        let broadcaster = StatusBroadcaster::new(config.subscriber_buffer, self.metrics);

        let with_macaroons = match mode {
            Mode::Standalone => true,
            Mode::Subserver { with_macaroons } => *with_macaroons,
        };
        let macaroons = if with_macaroons {
            Some(self.start_macaroon_service(opened).await?)
        } else {
            None
        };

        let bound = match mode {
            Mode::Standalone => Some(self.bind_listeners()?),
            Mode::Subserver { .. } => None,
        };
        let rpc_addr = bound.as_ref().and_then(|b| b.rpc.local_addr().ok());
        let rest_addr = bound
            .as_ref()
            .and_then(|b| b.rest.as_ref())
            .and_then(|l| l.local_addr().ok());

        let info = ServerInfo {
            network: config.network,
            rpc_listen: rpc_addr.map(|a| a.to_string()).unwrap_or_default(),
            rest_listen: rest_addr.map(|a| a.to_string()).unwrap_or_default(),
            macaroon_path: if with_macaroons {
                config.macaroon_path().display().to_string()
            } else {
                String::new()
            },
        };
        let server = Arc::new(SwapClientServer::new(
            backend.clone(),
            registry.clone(),
            broadcaster.clone(),
            self.metrics,
            info,
        ));

        let serving = match bound {
            Some(bound) => Some(self.prepare_serving(bound, server.clone(), macaroons.clone())?),
            None => None,
        };

        Ok(Prepared {
            backend,
            registry,
            broadcaster,
            server,
            macaroons,
            serving,
        })
    }

    async fn open_root_key_store(&self) -> Result<Arc<dyn RootKeyStore>, DaemonError> {
        if let Some(store) = &self.root_key_store {
            return Ok(store.clone());
        }

        let path = self.config.root_key_db_path();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                DaemonError::init(format!("unable to create {}: {e}", dir.display()))
            })?;
        }

        match SqliteRootKeyStore::open(&path, ROOT_KEY_DB_TIMEOUT).await {
            Ok(store) => Ok(Arc::new(store)),
            Err(StoreError::Locked) => Err(DaemonError::init(format!(
                "unable to open {}: database is locked, make sure no other loop daemon \
                 process is running",
                path.display()
            ))),
            Err(e) => Err(DaemonError::init(format!(
                "unable to open {}: {e}",
                path.display()
            ))),
        }
    }

    async fn start_macaroon_service(
        &self,
        opened: &mut OpenedResources,
    ) -> Result<Arc<MacaroonService>, DaemonError> {
        let store = self.open_root_key_store().await?;
        opened.store = Some(store.clone());

        let service = Arc::new(MacaroonService::new(MacaroonServiceConfig {
            root_key_store: store,
            required_permissions: permission_table(),
            macaroon_path: Some(self.config.macaroon_path()),
        }));
        service
            .start()
            .await
            .map_err(|e| DaemonError::init(format!("unable to start macaroon service: {e}")))?;
        opened.macaroons = Some(service.clone());

        Ok(service)
    }

    fn bind_listeners(&self) -> Result<BoundListeners, DaemonError> {
        let mut listeners = self
            .listeners
            .lock()
            .ok()
            .and_then(|mut l| l.take())
            .ok_or_else(|| DaemonError::init("listener configuration already consumed"))?;

        if listeners.tls.is_none() {
            if let Some(tls) = &self.config.tls {
                listeners.tls = Some(TlsMaterial::load(tls)?);
            }
        }

        BoundListeners::bind(listeners)
    }

    fn prepare_serving(
        &self,
        bound: BoundListeners,
        server: Arc<SwapClientServer>,
        macaroons: Option<Arc<MacaroonService>>,
    ) -> Result<Serving, DaemonError> {
        let BoundListeners { rpc, rest, tls } = bound;

        let authorizer: Arc<dyn Authorizer> = macaroons
            .ok_or_else(|| DaemonError::init("the RPC server requires the macaroon service"))?;
        let rpc_addr = rpc
            .local_addr()
            .map_err(|e| DaemonError::init(format!("unable to read RPC listen address: {e}")))?;
        let acceptor = tls.as_ref().map(|t| t.acceptor.clone());

        let gateway = match rest {
            Some(listener) => {
                let mut client = RpcClient::new(dial_addr(rpc_addr));
                if let Some(tls) = &tls {
                    client = client.with_tls(tls.connector.clone());
                }
                let router = gateway::router(client, self.metrics, &self.config.cors_origin)?;
                Some((listener, router))
            }
            None => {
                info!("REST gateway disabled");
                None
            }
        };

        Ok(Serving {
            rpc: RpcServer::new(rpc, acceptor.clone(), server, authorizer, self.metrics),
            gateway,
            tls: acceptor,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TASKS
    // ═══════════════════════════════════════════════════════════════════════════

    fn spawn_tasks(
        &self,
        prepared: Prepared,
        opened: OpenedResources,
        result_tx: oneshot::Sender<DaemonResult>,
    ) {
        let Prepared {
            backend,
            registry,
            broadcaster,
            server,
            macaroons,
            serving,
        } = prepared;

        let liquidity = backend.liquidity_manager();
        let server_count = serving
            .as_ref()
            .map_or(0, |s| 1 + usize::from(s.gateway.is_some()));
        let task_count = 2 + usize::from(liquidity.is_some()) + server_count;

        let main = CancellationToken::new();
        let tasks = TaskTracker::new();
        let servers = TaskTracker::new();
        let (errors_tx, errors_rx) = mpsc::channel(task_count);
        let spawner = TaskSpawner {
            errors: errors_tx,
            cancel: main.clone(),
            metrics: self.metrics,
        };

        let mut running = Running {
            server,
            macaroons: macaroons.clone(),
            rpc_addr: None,
            rest_addr: None,
        };

        let (status_tx, status_rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let cancel = main.clone();
        spawner.spawn(&tasks, TASK_BACKEND, async move {
            backend.run(cancel, status_tx).await
        });
        spawner.spawn(
            &tasks,
            TASK_STATUS,
            forward_status_updates(registry, broadcaster, status_rx, self.metrics, main.clone()),
        );
        if let Some(manager) = liquidity {
            let cancel = main.clone();
            spawner.spawn(&tasks, TASK_LIQUIDITY, async move { manager.run(cancel).await });
        }

        if let Some(Serving { rpc, gateway, tls }) = serving {
            running.rpc_addr = rpc.local_addr();
            spawner.spawn(&servers, TASK_RPC, rpc.serve(main.clone()));

            if let Some((listener, router)) = gateway {
                running.rest_addr = listener.local_addr().ok();
                spawner.spawn(
                    &servers,
                    TASK_REST,
                    gateway::serve(listener, router, tls, main.clone()),
                );
            }
        }
        drop(spawner);

        if self.running.set(running).is_err() {
            warn!("Daemon handles were already published");
        }

        let supervisor = Supervisor {
            quit: self.quit.clone(),
            main,
            errors: errors_rx,
            tasks,
            servers,
            opened,
            result_tx,
            metrics: self.metrics,
        };
        tokio::spawn(supervisor.run());
    }
}

fn permission_table() -> PermissionTable {
    #[allow(unused_mut)]
    let mut table = required_permissions();
    #[cfg(feature = "debug")]
    table.extend(loopd_auth::debug_permissions());
    table
}

struct Prepared {
    backend: Arc<dyn WalletBackend>,
    registry: Arc<SwapRegistry>,
    broadcaster: Arc<StatusBroadcaster>,
    server: Arc<SwapClientServer>,
    macaroons: Option<Arc<MacaroonService>>,
    serving: Option<Serving>,
}

struct Serving {
    rpc: RpcServer,
    gateway: Option<(TcpListener, Router)>,
    tls: Option<TlsAcceptor>,
}

/// Resources to release on shutdown, or when startup fails midway
#[derive(Default)]
struct OpenedResources {
    macaroons: Option<Arc<MacaroonService>>,
    store: Option<Arc<dyn RootKeyStore>>,
    /// Only set when the daemon owns the backend
    backend: Option<Arc<dyn WalletBackend>>,
}

impl OpenedResources {
    async fn close(self) {
        if let Some(macaroons) = self.macaroons {
            macaroons.stop();
        }
        if let Some(store) = self.store {
            store.close().await;
        }
        if let Some(backend) = self.backend {
            backend.close().await;
        }
    }
}

struct TaskFailure {
    task: &'static str,
    message: String,
}

struct TaskSpawner {
    errors: mpsc::Sender<TaskFailure>,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl TaskSpawner {
    /// Track `task` and report its error unless shutdown already began
    fn spawn<F, E>(&self, tracker: &TaskTracker, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let errors = self.errors.clone();
        let cancel = self.cancel.clone();
        let metrics = self.metrics;

        metrics.task_started(name);
        tracker.spawn(async move {
            let result = task.await;
            metrics.task_stopped(name);

            match result {
                Ok(()) => debug!(task = name, "Task finished"),
                Err(err) if cancel.is_cancelled() => {
                    debug!(task = name, error = %err, "Task ended during shutdown")
                }
                Err(err) => {
                    error!(task = name, error = %err, "Task failed");
                    let failure = TaskFailure {
                        task: name,
                        message: err.to_string(),
                    };
                    if errors.try_send(failure).is_err() {
                        debug!(task = name, "Failure not reported, shutdown already underway");
                    }
                }
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SHUTDOWN
// ═══════════════════════════════════════════════════════════════════════════

/// Waits for a stop request or the first task failure, then tears down
struct Supervisor {
    quit: CancellationToken,
    main: CancellationToken,
    errors: mpsc::Receiver<TaskFailure>,
    tasks: TaskTracker,
    servers: TaskTracker,
    opened: OpenedResources,
    result_tx: oneshot::Sender<DaemonResult>,
    metrics: MetricsCollector,
}

impl Supervisor {
    async fn run(mut self) {
        let result = tokio::select! {
            Some(failure) = self.errors.recv() => {
                self.metrics.record_runtime_failure(failure.task);
                error!(task = failure.task, error = %failure.message, "Shutting down after task failure");
                Err(DaemonError::RuntimeFailure {
                    task: failure.task.to_string(),
                    message: failure.message,
                })
            }
            _ = self.quit.cancelled() => {
                info!("Shutting down loop daemon");
                Ok(())
            }
        };

        self.main.cancel();

        self.servers.close();
        self.servers.wait().await;
        debug!("Servers stopped");

        self.opened.close().await;

        self.tasks.close();
        self.tasks.wait().await;
        info!("Loop daemon stopped");

        if self.result_tx.send(result).is_err() {
            debug!("Nobody is waiting for the daemon result");
        }
    }
}
