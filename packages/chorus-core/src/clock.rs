//! Client-clock timestamps, shared by the time-sync driver and the
//! renderer so "now" means the same thing in every component that reasons
//! about deadlines.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current client-clock time in signed microseconds since the Unix epoch,
/// saturating rather than panicking on an unrepresentable value.
#[must_use]
pub fn now_client_us() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros(),
    )
    .unwrap_or(i64::MAX)
}
