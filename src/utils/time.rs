use crate::utils::Result;
use chrono::{DateTime, Utc};

/// Formats a millisecond UNIX timestamp the way acquisition software does:
/// `2017-09-12T09:50:12.456+00:00`, always three millisecond digits, UTC only.
pub fn timestamp_to_string(time_ms: u64) -> Result<String> {
    let dt = DateTime::<Utc>::from_timestamp_millis(time_ms as i64)
        .ok_or_else(|| format!("Timestamp {} ms is out of range", time_ms))?;
    Ok(dt.format("%Y-%m-%dT%H:%M:%S%.3f+00:00").to_string())
}

/// Parses a timestamp written by [`timestamp_to_string`]. One to three
/// millisecond digits are accepted.
pub fn timestamp_from_string(time_stamp: &str) -> Result<u64> {
    let dt = DateTime::parse_from_rfc3339(time_stamp)
        .map_err(|e| format!("Invalid timestamp '{}': {}", time_stamp, e))?;
    let ms = dt.with_timezone(&Utc).timestamp_millis();
    if ms < 0 {
        return Err(format!("Timestamp '{}' is before the epoch", time_stamp));
    }
    Ok(ms as u64)
}

/// Shifts a textual timestamp forward by `offset_ms` milliseconds.
pub fn adjust_timestamp(time_stamp: &str, offset_ms: u64) -> Result<String> {
    timestamp_to_string(timestamp_from_string(time_stamp)? + offset_ms)
}
