//! Shared utility functions used across the codebase.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else (including unset) maps to `default`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Milliseconds since the Unix epoch.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`to_millis`]. Out-of-range values clamp to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap_or_default())
}

/// Midnight (UTC) starting the day that contains `at`.
pub fn start_of_utc_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(at)
}

/// Midnight (UTC) ending the day that contains `at`.
pub fn next_utc_midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    start_of_utc_day(at) + Duration::days(1)
}
