//! Format and modifier negotiation.
//!
//! - [`ModifierCatalog`]: per-format GPU-importable modifiers, shrinking only
//! - [`StreamNegotiator`]: builds the offers and buffer/meta params sent to the bus
//! - [`RenegotiationController`]: narrows the catalog after a failed import

pub mod catalog;
pub mod offers;
pub mod renegotiate;

pub use catalog::{DmaBufCapabilities, ModifierCatalog, NoDmaBuf};
pub use offers::StreamNegotiator;
pub use renegotiate::{RenegotiationAction, RenegotiationController};

use crate::bus::ProtocolVersion;

/// First protocol version able to carry DMA-BUFs at all.
pub const DMABUF_MIN_VERSION: ProtocolVersion = ProtocolVersion::new(0, 3, 24);
/// First protocol version supporting late fixation of enumerated modifiers.
pub const DMABUF_MODIFIER_MIN_VERSION: ProtocolVersion = ProtocolVersion::new(0, 3, 33);
/// First server version that renegotiates safely after dropping one modifier.
pub const DROP_SINGLE_MODIFIER_MIN_VERSION: ProtocolVersion = ProtocolVersion::new(0, 3, 40);

/// Version-gated capabilities for one negotiation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationFlags {
    pub allow_dmabuf: bool,
    pub dont_fixate: bool,
}

impl NegotiationFlags {
    /// Both sides must meet each minimum. An unknown server version is
    /// treated as new enough.
    pub fn for_versions(client: ProtocolVersion, server: Option<ProtocolVersion>) -> Self {
        let meets = |min: ProtocolVersion| server.map_or(true, |s| client >= min && s >= min);
        Self {
            allow_dmabuf: meets(DMABUF_MIN_VERSION),
            dont_fixate: meets(DMABUF_MODIFIER_MIN_VERSION),
        }
    }
}
