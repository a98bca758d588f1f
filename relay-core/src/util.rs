use chrono::Utc;

/// Seconds since the Unix epoch.
pub fn now_ts() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
