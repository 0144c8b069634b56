//! Readiness drivers for a bus connection.
//!
//! The engine never blocks on its own; these helpers forward readiness of the
//! loop descriptor into [`ConnectionRef::iterate`].

use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::trace;

use crate::error::Result;

use super::ConnectionRef;

/// Wait up to `timeout` for the loop to become ready, then run one step.
///
/// Returns `false` when the wait timed out without running the loop.
pub fn pump(conn: &ConnectionRef, timeout: Duration) -> Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let ready = conn.with_loop_fd(|fd| {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(millis))
    })?;

    if ready == 0 {
        return Ok(false);
    }
    let dispatched = conn.iterate()?;
    trace!("Dispatched {} bus events", dispatched);
    Ok(true)
}

/// Drive `conn` from a tokio reactor until no stream listens on it anymore.
///
/// The driver does not keep the connection alive: once the last stream
/// detaches it returns and the connection tears down.
/// Connections are thread-confined, so this must run on a `LocalSet`.
#[cfg(feature = "tokio-driver")]
pub async fn drive(conn: ConnectionRef) -> Result<()> {
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    let fd = conn.with_loop_fd(crate::utils::dup_handle)?;
    let fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
    let idle = conn.idle_signal();
    let weak = conn.downgrade();
    drop(conn);

    while weak.upgrade().is_some_and(|conn| conn.has_listeners()) {
        tokio::select! {
            guard = fd.readable() => {
                let mut guard = guard?;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = conn.iterate() {
                    tracing::warn!("Bus loop step failed: {}", e);
                }
                guard.clear_ready();
            }
            _ = idle.notified() => {}
        }
    }
    tracing::debug!("Bus driver finished");
    Ok(())
}
