use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::ConnectivityError;
use crate::provider::Transport;

/// Transport-level settings handed to providers when they build connections.
///
/// Derived from the [`ConnectivityConfig`](crate::client::ConnectivityConfig)
/// at `connect()` time.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on establishing the physical link.
    pub connect_timeout: Duration,
    /// Whether to disable Nagle's algorithm on TCP transports.
    pub tcp_nodelay: bool,
    /// Idle time before TCP keepalives start, if keepalive is wanted.
    pub tcp_keepalive_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
        }
    }
}

/// One physical handle to a specific host: raw transport plus handshake and
/// liveness state.
///
/// While borrowed from the pool a connection is exclusively owned by the
/// borrower, which serializes commands on it; otherwise the pool owns it.
pub struct Connection {
    id: u64,
    addr: SocketAddr,
    keyspace: String,
    open: bool,
    closed: bool,
    transport: Box<dyn Transport>,
}

impl Connection {
    /// Wraps a provider transport into an unopened connection.
    pub fn new(
        id: u64,
        addr: SocketAddr,
        keyspace: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            id,
            addr,
            keyspace: keyspace.into(),
            open: false,
            closed: false,
            transport,
        }
    }

    /// Monotonically increasing identifier, unique within one manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The host this connection points at.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The keyspace selected during the handshake.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// True after a successful handshake, until the connection is closed or a
    /// liveness probe fails.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The provider-supplied transport. Providers downcast this to their
    /// concrete type via [`Transport::as_any_mut`].
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }

    /// Performs the handshake: establish the transport and select the target
    /// keyspace.
    pub async fn open(&mut self) -> Result<(), ConnectivityError> {
        self.transport.handshake(self.addr, &self.keyspace).await?;
        self.open = true;
        debug!(id = self.id, addr = %self.addr, "connection opened");
        Ok(())
    }

    /// Issues a cheap liveness probe.
    ///
    /// Any probe failure is logged and swallowed; the connection is then
    /// permanently broken and reports `false` from here on.
    pub async fn is_valid(&mut self) -> bool {
        if !self.open {
            return false;
        }
        match self.transport.probe().await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    id = self.id,
                    addr = %self.addr,
                    error = %err,
                    "liveness probe failed, connection is broken"
                );
                self.open = false;
                false
            }
        }
    }

    /// Releases the transport. Idempotent; close failures are logged and
    /// swallowed.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open = false;
        if let Err(err) = self.transport.shutdown().await {
            debug!(id = self.id, addr = %self.addr, error = %err, "error while closing connection");
        } else {
            debug!(id = self.id, addr = %self.addr, "connection closed");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("keyspace", &self.keyspace)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}
