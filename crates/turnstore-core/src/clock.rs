//! Microsecond wall clock.
//!
//! Timestamps are stored as integer microseconds, so every timestamp handed
//! out here is already truncated to that precision and survives a storage
//! round trip unchanged.

use chrono::{DateTime, Duration, Utc};

/// Current time truncated to microseconds.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Truncate a timestamp to microsecond precision.
pub fn truncate(dt: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(dt.timestamp_micros())
}

/// Convert stored microseconds back into a timestamp.
pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// The next `last_update_time` after `previous`: the current time, but always
/// strictly later than `previous`.
pub fn advance(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}
