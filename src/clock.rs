//! Monotonic to wall clock translation
//!
//! The qdisc stamps records with `CLOCK_MONOTONIC`. Queue samples are stored
//! with epoch timestamps, so the offset between the two clocks is captured
//! once per session and added to every queue timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current `CLOCK_MONOTONIC` reading in nanoseconds.
#[cfg(unix)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Nanoseconds since the first call in this process.
#[cfg(not(unix))]
pub fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Offset to add to a monotonic millisecond timestamp to get epoch milliseconds.
pub fn monotonic_offset_ms() -> u64 {
    epoch_ms().saturating_sub(monotonic_ns() / 1_000_000)
}
