//! The pluggable wire-protocol boundary.
//!
//! A [`ConnectionProvider`] turns opaque [`Command`]s into traffic on a
//! concrete protocol. The connectivity layer is compiled against these traits
//! only; [`crate::network::FramedProvider`] is the default implementation.

use std::any::Any;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::client::ConnectionManager;
use crate::command::{Command, CommandBatch, CommandResponse, Consistency};
use crate::errors::{ConnectivityError, ExecutionError, ScanError};
use crate::network::{Connection, ConnectionConfig};

/// One physical link to a host, as a provider implements it.
///
/// A transport starts disconnected; [`Transport::handshake`] establishes the
/// link and selects the target keyspace in one step.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the physical link to `addr` and selects `keyspace` on it.
    ///
    /// The error distinguishes transport-level failure (host unreachable)
    /// from protocol-level failure (host reachable, keyspace selection
    /// rejected).
    async fn handshake(&mut self, addr: SocketAddr, keyspace: &str) -> Result<(), ConnectivityError>;

    /// Cheap liveness check of an established link.
    async fn probe(&mut self) -> Result<(), std::io::Error>;

    /// Releases the link. Must be idempotent.
    async fn shutdown(&mut self) -> Result<(), std::io::Error>;

    /// Providers recover their concrete transport type here when handed a
    /// [`Connection`] to execute on.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Wire-protocol plugin executing commands against live connections.
///
/// Selected at compile time and injected into
/// [`ConnectionManager::new`](crate::client::ConnectionManager::new).
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Builds an unopened [`Connection`] to `addr`, carrying this provider's
    /// transport.
    fn new_connection(
        &self,
        id: u64,
        addr: SocketAddr,
        keyspace: &str,
        config: &ConnectionConfig,
    ) -> Connection;

    /// Executes one command on an open connection.
    async fn execute(
        &self,
        command: &Command,
        connection: &mut Connection,
        consistency: Consistency,
    ) -> Result<CommandResponse, ExecutionError>;

    /// Executes a batch on an open connection. Grouping and ordering of the
    /// batch's sub-commands on the wire is this provider's business.
    async fn execute_batch(
        &self,
        batch: &CommandBatch,
        connection: &mut Connection,
        consistency: Consistency,
    ) -> Result<(), ExecutionError>;

    /// Builds a fresh topology detector for one rescan.
    fn new_cluster_detector(&self) -> Box<dyn ClusterDetector>;
}

/// Reconciles the live cluster topology into the node registry.
///
/// A detector is created per rescan and reports what it saw through
/// [`NodeRegistry::node_available`](crate::cluster::NodeRegistry::node_available),
/// [`node_unavailable`](crate::cluster::NodeRegistry::node_unavailable) and
/// [`mark_seed`](crate::cluster::NodeRegistry::mark_seed). This is the only
/// path by which newly joined hosts enter the registry outside of static
/// configuration.
#[async_trait]
pub trait ClusterDetector: Send + Sync {
    /// Performs one topology scan on behalf of `manager`.
    async fn scan(&self, manager: &ConnectionManager) -> Result<(), ScanError>;
}
