use chrono::{DateTime, TimeZone, Utc};

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds back to a UTC timestamp.
///
/// Out-of-range values clamp to the epoch rather than panic; SQLite rows
/// written by this engine are always in range.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Round a timestamp down to the whole second.
///
/// Used by the dedup fingerprint so provider retries that drift by
/// milliseconds still collide.
pub fn round_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_ms(ts.timestamp() * 1000)
}

/// Truncate a string to at most `max_bytes`, respecting char boundaries.
///
/// Provider error bodies are stored truncated so a misbehaving endpoint
/// cannot bloat message metadata.
pub fn truncate_chars(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
