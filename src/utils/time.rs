use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Current unix time in milliseconds, for clock-offset arithmetic.
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_millis(0))
        .as_millis()
}

/// Whether a TTL that started counting at `since` has run out.
pub fn expired(since: u64, ttl_secs: u64) -> bool {
    now_secs() > since.saturating_add(ttl_secs)
}
