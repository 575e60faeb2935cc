//! Conversion of server wall-clock timestamps to monotonic instants.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Map an absolute wall-clock time onto the monotonic clock.
///
/// Times already in the past map to "now".
pub fn instant_from_utc(at: DateTime<Utc>) -> Instant {
    instant_from_utc_at(at, Utc::now(), Instant::now())
}

/// Map `at` onto the monotonic clock given a paired wall/monotonic reading.
pub fn instant_from_utc_at(at: DateTime<Utc>, wall_now: DateTime<Utc>, mono_now: Instant) -> Instant {
    match (at - wall_now).to_std() {
        Ok(ahead) => mono_now + ahead,
        Err(_) => mono_now,
    }
}
