//! Failover-aware pooled connectivity for clustered data stores.
//!
//! `palisade` sits between an application (or the mapping layer above it) and
//! a multi-node data store. It keeps track of which cluster members are
//! reachable, picks a member for each outgoing command via round robin with a
//! seed-node fallback, and lends out physical connections from a bounded pool
//! so no request pays for a fresh handshake.
//!
//! # Connecting
//! All activity revolves around the [`ConnectionManager`], built from a
//! [`ConnectivityConfig`] and a wire-protocol [`ConnectionProvider`]:
//!
//! ```rust,no_run
//! use palisade::{ConnectionManager, ConnectivityConfig, FramedProvider};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let config = ConnectivityConfig::new(["10.0.0.1:9160", "10.0.0.2"], "app");
//!     let manager = ConnectionManager::new(config, FramedProvider::new());
//!     manager.connect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Executing commands
//! Commands are opaque to this layer: a target collection, a row key and a
//! payload the provider understands. The manager routes each command to a
//! live node and contains failures: a broken connection is destroyed and its
//! host demoted, never retried transparently.
//!
//! ```rust,no_run
//! # use palisade::{Command, ConnectionManager, Consistency};
//! # async fn check_only_compiles(manager: &ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let command = Command::new("events", &b"row-1"[..], &b"\x01payload"[..]);
//! let _response = manager.execute(&command, Consistency::Quorum).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Plugging in a protocol
//! The wire protocol is a compile-time choice: implement
//! [`ConnectionProvider`] (plus its [`Transport`] and [`ClusterDetector`])
//! and hand it to [`ConnectionManager::new`]. The bundled [`FramedProvider`]
//! speaks a minimal length-prefixed TCP envelope.

pub mod client;
pub mod cluster;
pub mod command;
pub mod errors;
pub mod network;
pub mod provider;
mod utils;

pub use client::{ConnectionManager, ConnectivityConfig, ExhaustionPolicy};
pub use cluster::{Node, NodeRegistry};
pub use command::{Command, CommandBatch, CommandResponse, Consistency};
pub use network::{Connection, ConnectionConfig, FramedProvider};
pub use provider::{ClusterDetector, ConnectionProvider, Transport};
