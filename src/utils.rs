use std::time::Duration;
use tokio::time::Instant;

/// Default number of requests admitted per window
pub const DEFAULT_MAX: u64 = 1000;

/// Default window length in milliseconds
pub const DEFAULT_TIME_WINDOW_MS: u64 = 60_000;

/// Monotonic clock used by the local store to age counters.
///
/// Backed by the tokio clock so tests running with paused time advance it
/// deterministically.
#[derive(Debug, Clone, Copy)]
pub struct TimeSource {
    origin: Instant,
}

impl TimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the time source was created
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret a numeric `max` setting. NaN, infinities and negatives mean "unset".
pub fn max_from_f64(value: f64) -> Option<u64> {
    if value.is_finite() && value >= 0.0 {
        Some(value as u64)
    } else {
        None
    }
}

/// Interpret a numeric window setting in milliseconds.
///
/// NaN, infinities, negatives and zero mean "unset".
pub fn window_from_f64(value: f64) -> Option<u64> {
    if value.is_finite() && value >= 1.0 {
        Some(value as u64)
    } else {
        None
    }
}

/// Parse a window such as `"1 minute"`, `"10 seconds"`, `"500ms"` or `"2500"`.
///
/// A bare number is read as milliseconds. Returns `None` for anything that is
/// negative, zero or unparseable so callers can fall back to the default.
pub fn parse_time_window(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Ok(number) = trimmed.parse::<f64>() {
        return window_from_f64(number);
    }

    humantime::parse_duration(trimmed)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .filter(|ms| *ms > 0)
}

/// Whole seconds until `ttl_ms` elapses, rounded up
pub fn ttl_in_seconds(ttl_ms: u64) -> u64 {
    ttl_ms.div_ceil(1000)
}

/// Retry hint for the `exponent`-th consecutive rejection: `window * 2^exponent`,
/// saturating at the largest representable duration.
pub fn backoff_ttl(window_ms: u64, exponent: u64) -> u64 {
    u32::try_from(exponent)
        .ok()
        .and_then(|exp| 2u64.checked_pow(exp))
        .and_then(|factor| window_ms.checked_mul(factor))
        .unwrap_or(u64::MAX)
}

/// Human readable duration in the long form used by rejection messages:
/// `"1 second"`, `"2 seconds"`, `"1 minute"`, `"250 ms"`.
pub fn humanize_duration(duration: Duration) -> String {
    const SECOND: f64 = 1000.0;
    const MINUTE: f64 = SECOND * 60.0;
    const HOUR: f64 = MINUTE * 60.0;
    const DAY: f64 = HOUR * 24.0;

    let ms = duration.as_millis() as f64;

    if ms >= DAY {
        return plural(ms, DAY, "day");
    }
    if ms >= HOUR {
        return plural(ms, HOUR, "hour");
    }
    if ms >= MINUTE {
        return plural(ms, MINUTE, "minute");
    }
    if ms >= SECOND {
        return plural(ms, SECOND, "second");
    }
    format!("{} ms", ms as u64)
}

fn plural(ms: f64, unit: f64, name: &str) -> String {
    let suffix = if ms >= unit * 1.5 { "s" } else { "" };
    format!("{} {}{}", (ms / unit).round() as u64, name, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_window() {
        assert_eq!(parse_time_window("1 minute"), Some(60_000));
        assert_eq!(parse_time_window("10 seconds"), Some(10_000));
        assert_eq!(parse_time_window("500ms"), Some(500));
        assert_eq!(parse_time_window("2500"), Some(2500));
        assert_eq!(parse_time_window("-5"), None);
        assert_eq!(parse_time_window("-1 minute"), None);
        assert_eq!(parse_time_window("soon"), None);
        assert_eq!(parse_time_window("0"), None);
    }

    #[test]
    fn test_numeric_settings() {
        assert_eq!(max_from_f64(f64::NAN), None);
        assert_eq!(max_from_f64(-1.0), None);
        assert_eq!(max_from_f64(0.0), Some(0));
        assert_eq!(max_from_f64(10.0), Some(10));
        assert_eq!(window_from_f64(f64::NAN), None);
        assert_eq!(window_from_f64(0.0), None);
        assert_eq!(window_from_f64(1000.0), Some(1000));
    }

    #[test]
    fn test_ttl_in_seconds() {
        assert_eq!(ttl_in_seconds(0), 0);
        assert_eq!(ttl_in_seconds(1), 1);
        assert_eq!(ttl_in_seconds(1000), 1);
        assert_eq!(ttl_in_seconds(1001), 2);
        assert_eq!(ttl_in_seconds(u64::MAX), u64::MAX / 1000 + 1);
    }

    #[test]
    fn test_backoff_ttl() {
        assert_eq!(backoff_ttl(500, 0), 500);
        assert_eq!(backoff_ttl(500, 1), 1000);
        assert_eq!(backoff_ttl(500, 2), 2000);
        assert_eq!(backoff_ttl(500, 80), u64::MAX);
        assert_eq!(backoff_ttl(u64::MAX / 2, 2), u64::MAX);
    }

    #[test]
    fn test_humanize_duration() {
        assert_eq!(humanize_duration(Duration::from_millis(0)), "0 ms");
        assert_eq!(humanize_duration(Duration::from_millis(250)), "250 ms");
        assert_eq!(humanize_duration(Duration::from_secs(1)), "1 second");
        assert_eq!(humanize_duration(Duration::from_secs(2)), "2 seconds");
        assert_eq!(humanize_duration(Duration::from_secs(60)), "1 minute");
        assert_eq!(humanize_duration(Duration::from_secs(150)), "3 minutes");
        assert_eq!(humanize_duration(Duration::from_secs(3600)), "1 hour");
        assert_eq!(humanize_duration(Duration::from_secs(86400 * 3)), "3 days");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_source_follows_tokio_clock() {
        let time_source = TimeSource::new();
        assert_eq!(time_source.now_ms(), 0);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(time_source.now_ms(), 1500);
    }
}
