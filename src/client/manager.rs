use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::RemoteHandle;
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::client::config::{ConnectivityConfig, resolve_contact_points};
use crate::cluster::NodeRegistry;
use crate::command::{Command, CommandBatch, CommandResponse, Consistency};
use crate::errors::{
    ClusterUnavailableError, ConnectError, ExecutionError, ScanError, StateError,
};
use crate::network::pool::{Borrowed, Pool, PoolLifecycle};
use crate::network::{Connection, ConnectionConfig};
use crate::provider::ConnectionProvider;

/// The façade of the connectivity layer.
///
/// Composes the node registry, a bounded connection pool and a pluggable
/// wire-protocol provider. Callers submit opaque commands; the manager routes
/// each one to a live node over a pooled connection and contains failures by
/// destroying broken connections and demoting their hosts.
///
/// The lifecycle is `connect()` once, any number of concurrent operations,
/// `disconnect()` once; a disconnected manager is done for good.
pub struct ConnectionManager {
    config: ConnectivityConfig,
    connection_config: ConnectionConfig,
    registry: Arc<NodeRegistry>,
    provider: Arc<dyn ConnectionProvider>,
    next_connection_id: AtomicU64,
    shutting_down: AtomicBool,
    state: Mutex<Lifecycle>,
}

enum Lifecycle {
    New,
    Connecting,
    Connected(Arc<ConnectedState>),
    Stopped,
}

struct ConnectedState {
    pool: Pool<ConnectionFactory>,
    _poll_handle: RemoteHandle<()>,
}

impl ConnectionManager {
    /// Creates a disconnected manager around `provider`.
    ///
    /// Returned in an [`Arc`] because the pool factory and the topology poll
    /// worker hold weak references back to the manager.
    pub fn new(
        config: ConnectivityConfig,
        provider: impl ConnectionProvider + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_config: config.connection_config(),
            config,
            registry: Arc::new(NodeRegistry::new()),
            provider: Arc::new(provider),
            next_connection_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            state: Mutex::new(Lifecycle::New),
        })
    }

    /// Resolves the contact points, seeds the registry, builds the pool and
    /// starts the periodic topology rescan.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        {
            let mut state = self.lock_state();
            match &*state {
                Lifecycle::New => *state = Lifecycle::Connecting,
                Lifecycle::Connecting | Lifecycle::Connected(_) => {
                    return Err(StateError::AlreadyConnected.into());
                }
                Lifecycle::Stopped => return Err(StateError::Stopped.into()),
            }
        }

        match self.bootstrap().await {
            Ok(connected) => {
                *self.lock_state() = Lifecycle::Connected(connected);
                debug!(hosts = self.registry.len(), "connectivity layer connected");
                Ok(())
            }
            Err(err) => {
                // Leave the manager usable so the caller may fix the
                // configuration environment and connect again.
                *self.lock_state() = Lifecycle::New;
                Err(err)
            }
        }
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<Arc<ConnectedState>, ConnectError> {
        if self.config.contact_points.is_empty() {
            return Err(ConnectError::EmptyContactPoints);
        }
        let (mut resolved, failed) = resolve_contact_points(&self.config).await;
        if resolved.is_empty() {
            return Err(ConnectError::FailedToResolveAnyHostname(failed));
        }

        // Spread first connections across contact points instead of having
        // every client hammer the first configured host.
        resolved.shuffle(&mut rand::rng());
        for addr in &resolved {
            self.registry.node_available(*addr);
            self.registry.mark_seed(*addr);
        }

        let pool = Pool::new(
            ConnectionFactory {
                manager: Arc::downgrade(self),
            },
            self.config.pool_policy(),
        );
        let poll_handle = self.spawn_topology_poller();
        Ok(Arc::new(ConnectedState {
            pool,
            _poll_handle: poll_handle,
        }))
    }

    fn spawn_topology_poller(self: &Arc<Self>) -> RemoteHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.cluster_poll_interval;
        let (fut, handle) = async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if manager.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                trace!("running periodic cluster scan");
                if let Err(err) = manager.scan_cluster().await {
                    // A flaky topology probe must never kill the manager.
                    warn!(error = %err, "periodic cluster scan failed");
                }
            }
        }
        .remote_handle();
        tokio::spawn(fut);
        handle
    }

    /// Opens a fresh connection via the host rotation.
    ///
    /// Attempts at most one connection per known host. Each successful
    /// handshake re-admits its host; each failure demotes it and moves on to
    /// the next candidate. Only an unrecoverable failure (shutdown) aborts
    /// the rotation early.
    pub async fn open_connection(&self) -> Result<Connection, ClusterUnavailableError> {
        let host_count = self.registry.len();
        if host_count == 0 {
            return Err(ClusterUnavailableError::NoKnownHosts);
        }

        let mut attempted = 0usize;
        let mut last_failure = None;
        for _ in 0..host_count {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(ClusterUnavailableError::ShuttingDown);
            }
            let Some(addr) = self.registry.next_host() else {
                break;
            };
            attempted += 1;
            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let mut connection =
                self.provider
                    .new_connection(id, addr, &self.config.keyspace, &self.connection_config);
            match connection.open().await {
                Ok(()) => {
                    // Optimistic re-admission: one good handshake is enough
                    // to put the host back into the rotation.
                    self.registry.node_available(addr);
                    trace!(id, %addr, "opened pooled connection");
                    return Ok(connection);
                }
                Err(err) if err.is_unrecoverable() => {
                    return Err(ClusterUnavailableError::ShuttingDown);
                }
                Err(err) => {
                    debug!(%addr, error = %err, "host attempt failed, demoting");
                    self.registry.node_unavailable(addr);
                    last_failure = Some(err);
                }
            }
        }

        Err(match last_failure {
            Some(last) => ClusterUnavailableError::AllHostsFailed { attempted, last },
            None => ClusterUnavailableError::NoSelectableHost { known: host_count },
        })
    }

    /// Executes one command on a pooled connection.
    ///
    /// Blocks while the pool is at capacity. Performs no transparent retry:
    /// a network-class failure destroys the borrowed connection, demotes its
    /// host and is re-raised as is.
    pub async fn execute(
        &self,
        command: &Command,
        consistency: Consistency,
    ) -> Result<CommandResponse, ExecutionError> {
        let state = self.connected_state()?;
        let mut borrowed = state.pool.borrow().await?;
        match self
            .provider
            .execute(command, borrowed.get_mut(), consistency)
            .await
        {
            Ok(response) => {
                borrowed.release().await;
                Ok(response)
            }
            Err(err) => {
                self.contain_failure(borrowed, &err).await;
                Err(err)
            }
        }
    }

    /// Executes a batch on a pooled connection, with the same
    /// borrow/return-or-invalidate contract as [`execute`](Self::execute).
    pub async fn execute_batch(
        &self,
        batch: &CommandBatch,
        consistency: Consistency,
    ) -> Result<(), ExecutionError> {
        let state = self.connected_state()?;
        let mut borrowed = state.pool.borrow().await?;
        match self
            .provider
            .execute_batch(batch, borrowed.get_mut(), consistency)
            .await
        {
            Ok(()) => {
                borrowed.release().await;
                Ok(())
            }
            Err(err) => {
                self.contain_failure(borrowed, &err).await;
                Err(err)
            }
        }
    }

    async fn contain_failure(&self, borrowed: Borrowed<ConnectionFactory>, err: &ExecutionError) {
        if err.is_network_class() {
            let addr = borrowed.get().addr();
            warn!(%addr, error = %err, "network failure, destroying connection and demoting host");
            borrowed.invalidate().await;
            self.registry.node_unavailable(addr);
        } else {
            // The host rejected the command but the link is fine.
            borrowed.release().await;
        }
    }

    /// Runs one topology rescan through the provider's detector.
    pub async fn scan_cluster(&self) -> Result<(), ScanError> {
        self.connected_state()
            .map_err(|err| ScanError::Execution(err.into()))?;
        self.provider.new_cluster_detector().scan(self).await
    }

    /// Borrows and immediately returns a connection: a liveness smoke test
    /// that executes no command.
    pub async fn test_connectivity(&self) -> Result<(), ExecutionError> {
        let state = self.connected_state()?;
        let borrowed = state.pool.borrow().await?;
        borrowed.release().await;
        Ok(())
    }

    /// Closes the pool and stops the topology poller. Terminal: the manager
    /// rejects every operation afterwards, including `connect()`.
    pub async fn disconnect(&self) -> Result<(), StateError> {
        let connected = {
            let mut state = self.lock_state();
            match &*state {
                Lifecycle::Connected(_) => {
                    let Lifecycle::Connected(connected) =
                        std::mem::replace(&mut *state, Lifecycle::Stopped)
                    else {
                        unreachable!("state changed under the lock");
                    };
                    connected
                }
                Lifecycle::New | Lifecycle::Connecting => return Err(StateError::NotConnected),
                Lifecycle::Stopped => return Err(StateError::Stopped),
            }
        };
        self.shutting_down.store(true, Ordering::Release);
        connected.pool.close().await;
        debug!("connectivity layer disconnected");
        Ok(())
    }

    /// The node registry, for detectors and diagnostics.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    /// Transport-level settings derived from the configuration.
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection_config
    }

    /// The keyspace every connection selects.
    pub fn keyspace(&self) -> &str {
        &self.config.keyspace
    }

    /// True while the manager accepts operations.
    pub fn is_connected(&self) -> bool {
        matches!(&*self.lock_state(), Lifecycle::Connected(_))
    }

    fn connected_state(&self) -> Result<Arc<ConnectedState>, StateError> {
        match &*self.lock_state() {
            Lifecycle::Connected(connected) => Ok(Arc::clone(connected)),
            Lifecycle::Stopped => Err(StateError::Stopped),
            Lifecycle::New | Lifecycle::Connecting => Err(StateError::NotConnected),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().expect("manager state lock poisoned")
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("keyspace", &self.config.keyspace)
            .field("connected", &self.is_connected())
            .field("known_hosts", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Adapts connection creation, validation and destruction to the pool's
/// lifecycle contract.
///
/// Validation gates on two independent signals: the registry's opinion of the
/// host (in-memory, cheap) and a fresh liveness probe of the connection
/// itself (network I/O). Both must pass for a borrow to reuse the connection.
struct ConnectionFactory {
    manager: Weak<ConnectionManager>,
}

#[async_trait]
impl PoolLifecycle for ConnectionFactory {
    type Resource = Connection;
    type Error = ClusterUnavailableError;

    async fn make(&self) -> Result<Connection, ClusterUnavailableError> {
        match self.manager.upgrade() {
            Some(manager) => manager.open_connection().await,
            None => Err(ClusterUnavailableError::ShuttingDown),
        }
    }

    async fn destroy(&self, mut connection: Connection) {
        connection.close().await;
    }

    async fn validate(&self, connection: &mut Connection) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        manager.registry.is_available(connection.addr()) && connection.is_valid().await
    }
}
