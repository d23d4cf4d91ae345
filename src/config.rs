use once_cell::sync::Lazy;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Minimum lead time, in hours, required between a cancellation and the
/// class start. Defaults to `4`.
pub static CANCELLATION_LEAD_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("CANCELLATION_LEAD_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(4)
});

/// Cadence of the consistency sync sweep (enrollment reconciliation and
/// auto-completion of past bookings). Defaults to 300 seconds.
pub static SYNC_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SYNC_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// Maximum number of concurrently pending membership requests per member.
pub static MAX_PENDING_REQUESTS_PER_MEMBER: Lazy<i64> = Lazy::new(|| {
    std::env::var("MAX_PENDING_REQUESTS_PER_MEMBER")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(2)
});
