//! The monotonic millisecond clock the runtime schedules against.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the first call in this process.
///
/// Deadlines throughout the runtime are absolute values of this clock.
pub fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Converts a caller-supplied timeout to milliseconds, rounding up so a
/// sub-millisecond timeout does not collapse to an immediate deadline.
pub(crate) fn timeout_ms(timeout: Duration) -> u64 {
    timeout
        .checked_add(Duration::from_nanos(999_999))
        .unwrap_or(timeout)
        .as_millis()
        .min(u64::MAX as u128) as u64
}
