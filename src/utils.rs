use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::{SystemTime, UNIX_EPOCH};

/// Duplicate a caller-supplied transport handle (close-on-exec) so the bus
/// session can own its copy without touching the caller's descriptor.
pub fn dup_handle(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}

/// Wall-clock time in nanoseconds, used when a buffer carries no header meta.
pub fn wall_clock_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
