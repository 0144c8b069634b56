//! Reaction to zero-copy buffers the GPU could not import

use tracing::info;

use crate::bus::ProtocolVersion;
use crate::capture::format::VideoFormat;

use super::{ModifierCatalog, DROP_SINGLE_MODIFIER_MIN_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenegotiationAction {
    /// The modifier was dropped; `remaining` candidates are left for the format.
    DroppedModifier { remaining: usize },
    /// The peer cannot renegotiate per modifier; zero-copy is now off for the
    /// whole stream.
    DisabledDmaBuf,
}

/// Owns the stream-wide zero-copy kill switch and narrows the catalog.
#[derive(Debug, Clone)]
pub struct RenegotiationController {
    server_version: Option<ProtocolVersion>,
    dmabuf_disabled: bool,
}

impl RenegotiationController {
    pub fn new(server_version: Option<ProtocolVersion>) -> Self {
        Self {
            server_version,
            dmabuf_disabled: false,
        }
    }

    pub fn set_server_version(&mut self, version: Option<ProtocolVersion>) {
        self.server_version = version;
    }

    /// Older (or unannounced) servers mishandle renegotiation after a single
    /// modifier is dropped.
    pub fn supports_incremental(&self) -> bool {
        self.server_version
            .is_some_and(|v| v >= DROP_SINGLE_MODIFIER_MIN_VERSION)
    }

    /// False once zero-copy was disabled wholesale; stays false.
    pub fn allows_dmabuf(&self) -> bool {
        !self.dmabuf_disabled
    }

    pub fn on_import_failure(
        &mut self,
        catalog: &mut ModifierCatalog,
        format: VideoFormat,
        modifier: u64,
    ) -> RenegotiationAction {
        let action = if self.supports_incremental() {
            catalog.remove(format, modifier);
            RenegotiationAction::DroppedModifier {
                remaining: catalog.modifiers(format).len(),
            }
        } else {
            self.dmabuf_disabled = true;
            RenegotiationAction::DisabledDmaBuf
        };

        info!(
            "Renegotiating, modifier {:#x} didn't work for {:?}: {:?}",
            modifier, format, action
        );
        metrics::counter!("renegotiations").increment(1);
        action
    }
}
