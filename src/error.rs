//! Error types for the stream engine

use thiserror::Error;

use crate::stream::StreamState;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a bus session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("failed to create bus context")]
    Context,

    #[error("failed to connect to bus: {0}")]
    Connect(String),

    #[error("failed to start bus loop: {0}")]
    Loop(String),

    #[error("unknown stream {0}")]
    UnknownStream(u32),

    #[error("stream request rejected: {0}")]
    Rejected(String),
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not open or connect to the bus. Terminal for the start request.
    #[error("connection failed: {0}")]
    Connection(#[source] BusError),

    /// The bus refused the stream connect call.
    #[error("could not connect stream to node {node_id}: {source}")]
    StreamConnect {
        node_id: u32,
        #[source]
        source: BusError,
    },

    #[error("invalid stream transition {from} -> {to}")]
    InvalidTransition { from: StreamState, to: StreamState },

    #[error("stream is not connected")]
    NotConnected,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}
