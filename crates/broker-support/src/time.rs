use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Monotonic clock reading used for timeouts, backoff and housekeeping intervals. Never
/// goes backwards, unlike `timestamp_secs`, so it's what the event loop ticks against.
#[inline]
pub fn monotonic_now() -> Instant {
    Instant::now()
}
