//! The caller-facing side of the connectivity layer: configuration and the
//! [`ConnectionManager`] façade.

pub mod config;
mod manager;

pub use config::{ConnectivityConfig, DEFAULT_PORT, ExhaustionPolicy};
pub use manager::ConnectionManager;
