//! Physical connectivity: connections, the bounded pool that lends them out,
//! and the default framed-TCP provider.

mod connection;
pub mod framed;
pub(crate) mod pool;

pub use connection::{Connection, ConnectionConfig};
pub use framed::FramedProvider;
