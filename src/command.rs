//! The opaque command contract between the mapping layer above and the
//! connectivity layer.
//!
//! The connectivity layer never inspects command contents. It routes the
//! command to a live node and hands the provider whatever bytes came back.

use bytes::Bytes;

/// Per-call durability/visibility requirement, passed through verbatim to the
/// wire-protocol provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Consistency {
    /// Weakest guarantee the store offers.
    Any,
    /// One replica.
    One,
    /// Two replicas.
    Two,
    /// Three replicas.
    Three,
    /// A majority of replicas.
    #[default]
    Quorum,
    /// Every replica.
    All,
    /// A majority within the local datacenter.
    LocalQuorum,
    /// A majority within every datacenter.
    EachQuorum,
    /// One replica in the local datacenter.
    LocalOne,
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::LocalOne => "LOCAL_ONE",
        };
        write!(f, "{name}")
    }
}

/// One unit of work for the cluster: a target collection, a row identifier
/// and a protocol-specific payload.
#[derive(Debug, Clone)]
pub struct Command {
    /// Target collection (table / column family) the command addresses.
    pub table: String,
    /// Row identifier within the collection.
    pub key: Bytes,
    /// Protocol-specific payload; opaque to the connectivity layer.
    pub payload: Bytes,
}

impl Command {
    /// Wraps a target and payload into a command.
    pub fn new(table: impl Into<String>, key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// An ordered group of commands dispatched over a single connection.
///
/// Grouping and ordering semantics on the wire belong to the provider.
#[derive(Debug, Clone, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
}

impl CommandBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command to the batch.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Number of commands in the batch.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True if the batch holds no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterates over the batched commands in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}

impl From<Vec<Command>> for CommandBatch {
    fn from(commands: Vec<Command>) -> Self {
        Self { commands }
    }
}

impl FromIterator<Command> for CommandBatch {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}

/// Whatever bytes the cluster sent back for a command.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Protocol-specific response payload; opaque to the connectivity layer.
    pub payload: Bytes,
}
