//! Media bus interface.
//!
//! The bus transport itself (socket protocol, loop implementation) is provided
//! by a library binding and reached only through [`BusTransport`] and
//! [`BusSession`]. Everything the engine needs from the bus is expressed here:
//! loop readiness, stream creation and connection, parameter updates, buffer
//! dequeue/requeue and loop-local event sources.
//!
//! Asynchronous bus callbacks are flattened into a single tagged [`BusEvent`]
//! returned from [`BusSession::iterate`], and routed by [`BusConnection`].
//!
//! With the `pipewire` feature, [`pipewire::PipeWireBus`] implements the
//! transport on top of the PipeWire client library.

pub mod buffer;
pub mod connection;
pub mod driver;
pub mod param;
#[cfg(feature = "pipewire")]
pub mod pipewire;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

pub use buffer::{BusBuffer, Chunk, DataKind, DataPlane, MetaBitmap, MetaCursor, MetaHeader};
pub use connection::{acquire, BusConnection, BusListener, ConnectionRef, WeakConnection};
pub use param::{
    BufferParams, DataTypeMask, FormatOffer, IntRange, MetaKind, MetaParam, ModifierProperty,
    NegotiatedFormat, Param, Size,
};

/// Object id the bus uses for the core itself; errors on it are connection-fatal.
pub const CORE_ID: u32 = 0;

/// Version of the bus protocol library, as `major.minor.micro`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for ProtocolVersion {
    type Err = BusError;

    /// Parses the leading numeric components; missing ones count as zero and
    /// trailing suffixes (`1.0.3-rc1`) are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        let mut parsed = 0;
        for (slot, part) in parts.iter_mut().zip(s.trim().split('.')) {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            *slot = digits
                .parse()
                .map_err(|_| BusError::Rejected(format!("bad version {s:?}")))?;
            parsed += 1;
        }
        if parsed == 0 {
            return Err(BusError::Rejected(format!("bad version {s:?}")));
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Loop-local event source, signalled from the owning thread and delivered on
/// the next iterate step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    pub autoconnect: bool,
    pub dont_reconnect: bool,
}

impl ConnectFlags {
    pub const CONSUMER: ConnectFlags = ConnectFlags {
        autoconnect: true,
        dont_reconnect: true,
    };
}

/// Stream state as reported by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStreamState {
    Error,
    Unconnected,
    Connecting,
    Paused,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StateChanged {
        old: BusStreamState,
        new: BusStreamState,
        error: Option<String>,
    },
    /// The active format param changed; `None` means it was cleared.
    FormatChanged(Option<NegotiatedFormat>),
    /// A buffer is ready to be dequeued.
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    CoreInfo {
        version: String,
    },
    CoreError {
        id: u32,
        seq: i32,
        res: i32,
        message: String,
    },
    Stream {
        id: StreamId,
        event: StreamEvent,
    },
    Signalled(EventId),
}

/// Entry point of a bus binding.
pub trait BusTransport {
    /// Version of the client-side protocol library.
    fn library_version(&self) -> ProtocolVersion;

    /// Create a fresh reactor loop; no context or connection yet.
    fn create_loop(&self) -> Result<Box<dyn BusSession>, BusError>;
}

/// One loop + context + core connection.
///
/// All methods are called from the thread that created the session.
pub trait BusSession {
    /// Descriptor that becomes readable whenever [`BusSession::iterate`] has work.
    fn loop_fd(&self) -> BorrowedFd<'_>;

    fn enter(&mut self);
    fn leave(&mut self);

    fn create_context(&mut self) -> Result<(), BusError>;

    /// Connect the core, either to the default daemon or over `socket`.
    /// The session takes ownership of `socket`.
    fn connect(&mut self, socket: Option<OwnedFd>) -> Result<(), BusError>;
    fn disconnect(&mut self);

    /// Run one non-blocking reactor step and return the events it produced,
    /// in bus order.
    fn iterate(&mut self) -> Result<Vec<BusEvent>, BusError>;

    fn create_stream(&mut self, name: &str) -> Result<StreamId, BusError>;
    fn connect_stream(
        &mut self,
        id: StreamId,
        target: u32,
        flags: ConnectFlags,
        params: &[Param],
    ) -> Result<(), BusError>;
    fn update_params(&mut self, id: StreamId, params: &[Param]) -> Result<(), BusError>;
    fn set_active(&mut self, id: StreamId, active: bool) -> Result<(), BusError>;
    fn destroy_stream(&mut self, id: StreamId);

    fn dequeue_buffer(&mut self, id: StreamId) -> Option<BusBuffer>;
    fn queue_buffer(&mut self, id: StreamId, buffer: BusBuffer);

    fn add_event(&mut self) -> Result<EventId, BusError>;
    fn signal_event(&mut self, event: EventId);
    fn destroy_event(&mut self, event: EventId);
}
