//! Cluster membership as this client sees it: one [`Node`] per known host,
//! owned by the [`NodeRegistry`] which answers "which host should serve the
//! next attempt".

mod registry;

pub use registry::{Node, NodeRegistry};
