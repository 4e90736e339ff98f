//! Environment variable utilities
//!
//! ```ignore
//! use mitm_core::env::{env_get, env_get_ms};
//!
//! let threads: usize = env_get("MITM_NUM_THREADS", 5);
//! let timeout = env_get_ms("MITM_QUERY_TIMEOUT_MS", Duration::from_millis(100));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other set value is false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Millisecond count as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
