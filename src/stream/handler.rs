use thiserror::Error;

use crate::capture::format::VideoFormat;
use crate::capture::Frame;

/// The GPU could not import a delivered DMA-BUF.
///
/// Returned from [`StreamHandler::frame_received`] to narrow the modifier set
/// and renegotiate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("failed to import {format:?} buffer with modifier {modifier:#x}")]
pub struct ImportFailed {
    pub format: VideoFormat,
    pub modifier: u64,
}

/// Consumer side of a stream. All callbacks run synchronously inside the
/// connection's reactor step.
pub trait StreamHandler {
    /// One buffer arrived. DMA-BUF planes in `frame` are only valid for the
    /// duration of this call.
    fn frame_received(&mut self, frame: &Frame<'_>) -> Result<(), ImportFailed>;

    /// Parameters are fixed; rendering resources may be prepared.
    fn stream_ready(&mut self) {}

    fn start_streaming(&mut self) {}

    /// The stream stopped without being asked to, with the reason if one
    /// was reported.
    fn stop_streaming(&mut self, _reason: Option<&str>) {}

    /// A concrete format was chosen by the bus.
    fn parameters_changed(&mut self) {}

    /// The shared connection failed; every stream on it stops.
    fn connection_failed(&mut self, _message: &str) {}
}
