use std::fmt;

/// Lifecycle of a [`Stream`](super::Stream).
///
/// ```text
/// Idle -> Connecting -> Negotiating <-> ParamsFixed -> Streaming
///                            ^                            |
///                            +----------------------------+
/// ```
/// Every non-terminal state may move to `Stopped` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    Connecting,
    Negotiating,
    ParamsFixed,
    Streaming,
    Stopped,
    Error,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Error)
    }

    pub fn can_transition_to(self, to: StreamState) -> bool {
        use StreamState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (_, Stopped)
                | (_, Error)
                | (Idle, Connecting)
                | (Connecting, Negotiating)
                | (Negotiating, ParamsFixed)
                | (ParamsFixed, Negotiating)
                | (ParamsFixed, Streaming)
                | (Streaming, Negotiating)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Negotiating => "negotiating",
            StreamState::ParamsFixed => "params-fixed",
            StreamState::Streaming => "streaming",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        };
        f.write_str(name)
    }
}
