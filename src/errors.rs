//! Error types returned by the connectivity layer.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// A single host attempt could not produce a usable connection.
///
/// Raised while opening a connection to one specific host. Transport-level
/// variants mean the host could not be reached at all; [`ConnectivityError::Handshake`]
/// means the host was reachable but rejected keyspace selection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectivityError {
    /// The transport to the host could not be established.
    #[error("could not reach {addr}: {source}")]
    Transport {
        /// Address of the host that was attempted.
        addr: SocketAddr,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Establishing the transport did not complete within the configured timeout.
    #[error("timed out connecting to {addr}")]
    ConnectTimeout {
        /// Address of the host that was attempted.
        addr: SocketAddr,
    },

    /// The host was reachable but rejected the handshake.
    #[error("host {addr} rejected keyspace {keyspace:?}: {reason}")]
    Handshake {
        /// Address of the host that was attempted.
        addr: SocketAddr,
        /// Keyspace whose selection was rejected.
        keyspace: String,
        /// Reason reported by the host.
        reason: String,
    },

    /// The connectivity layer is shutting down; no further attempts make sense.
    #[error("connectivity layer is shutting down")]
    ShuttingDown,
}

impl ConnectivityError {
    /// True for failures that must abort the host-rotation loop instead of
    /// moving on to the next candidate.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, ConnectivityError::ShuttingDown)
    }
}

/// Opening a connection failed against every known host.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClusterUnavailableError {
    /// The node registry holds no hosts at all.
    #[error("no known hosts in the node registry")]
    NoKnownHosts,

    /// Hosts are known, but none is selectable (all unavailable, no seed fallback).
    #[error("no selectable hosts: all {known} known hosts are marked unavailable")]
    NoSelectableHost {
        /// Number of hosts in the registry.
        known: usize,
    },

    /// The connectivity layer started shutting down mid-rotation.
    #[error("connectivity layer is shutting down")]
    ShuttingDown,

    /// Every attempted host failed; carries the last underlying cause.
    #[error("all {attempted} attempted hosts failed; last cause: {last}")]
    AllHostsFailed {
        /// Number of hosts that were attempted.
        attempted: usize,
        /// Failure reported by the last attempted host.
        #[source]
        last: ConnectivityError,
    },
}

/// The connection pool could not lend out a connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// All connections are in use and the exhaustion policy is
    /// [`ExhaustionPolicy::Fail`](crate::client::ExhaustionPolicy::Fail).
    #[error("connection pool exhausted: all {max_active} connections in use")]
    Capacity {
        /// Configured upper bound on concurrently borrowed connections.
        max_active: usize,
    },

    /// No connection became free within the configured borrow timeout.
    #[error("timed out after {}ms waiting for a pooled connection", timeout.as_millis())]
    BorrowTimeout {
        /// The borrow timeout that elapsed.
        timeout: Duration,
    },

    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,

    /// A fresh connection had to be opened and no host could serve it.
    #[error(transparent)]
    ClusterUnavailable(#[from] ClusterUnavailableError),
}

/// The manager was asked to do something its lifecycle state forbids.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    /// Operation requires [`connect()`](crate::client::ConnectionManager::connect) first.
    #[error("connection manager is not connected")]
    NotConnected,

    /// [`connect()`](crate::client::ConnectionManager::connect) was called twice.
    #[error("connection manager is already connected")]
    AlreadyConnected,

    /// The manager has been disconnected; this instance is done for good.
    #[error("connection manager has been disconnected")]
    Stopped,
}

/// Executing a command against the cluster failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutionError {
    /// A previously healthy connection failed mid-command. The connection is
    /// destroyed and its host demoted; the command is never retried here.
    #[error("network failure on {addr}: {source}")]
    Network {
        /// Address the broken connection pointed at.
        addr: SocketAddr,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The host validly rejected the command. The connection stays healthy
    /// and goes back to the pool.
    #[error("host {addr} rejected the command: {reason}")]
    Protocol {
        /// Address of the rejecting host.
        addr: SocketAddr,
        /// Reason reported by the host.
        reason: String,
    },

    /// Catch-all for unexpected provider failures.
    #[error("unexpected failure on {addr}: {reason}")]
    Unknown {
        /// Address of the connection the failure surfaced on.
        addr: SocketAddr,
        /// Description of what went wrong.
        reason: String,
    },

    /// No connection could be borrowed for the command.
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),

    /// The manager is not in the `Connected` state.
    #[error(transparent)]
    State(#[from] StateError),
}

impl ExecutionError {
    /// Network-class failures invalidate the borrowed connection and demote
    /// its host. [`ExecutionError::Unknown`] is bookkept conservatively as a
    /// network failure.
    pub fn is_network_class(&self) -> bool {
        matches!(
            self,
            ExecutionError::Network { .. } | ExecutionError::Unknown { .. }
        )
    }
}

/// [`connect()`](crate::client::ConnectionManager::connect) failed before the pool was built.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectError {
    /// The configuration carries an empty contact point list.
    #[error("empty contact point list in configuration")]
    EmptyContactPoints,

    /// None of the configured contact points resolved to an address.
    #[error("couldn't resolve any contact point: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// The manager is not in the initial state.
    #[error(transparent)]
    State(#[from] StateError),
}

/// A topology rescan failed. The periodic poll worker logs and swallows these.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ScanError {
    /// The detector could not reach the host it was probing.
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    /// The detector found no host to ask about the topology.
    #[error(transparent)]
    ClusterUnavailable(#[from] ClusterUnavailableError),

    /// The detector ran a command that failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Detector-specific failure.
    #[error("cluster scan failed: {0}")]
    Detector(String),
}
