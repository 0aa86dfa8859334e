//! Wall-clock helpers.

use time::OffsetDateTime;

/// Current UTC time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Whether `ts` is a 13-digit millisecond timestamp.
pub fn is_ms_timestamp(ts: u64) -> bool {
    (crate::MIN_MS_TIMESTAMP..=crate::MAX_MS_TIMESTAMP).contains(&ts)
}
