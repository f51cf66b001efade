//! The retry policy for transient download failures.
//!
//! Status codes 413, 429 and every 5xx are retryable, as are connect and
//! timeout errors. A `Retry-After` header sent by the server overrides the
//! computed backoff, capped at a sane bound. `file://` requests are never
//! retried on status grounds since the status is synthesized locally.

use std::time::{Duration, SystemTime};

use reqwest::StatusCode;
pub use retry_policies::{policies::ExponentialBackoff, Jitter, RetryDecision, RetryPolicy};

/// The longest `Retry-After` value that is honored.
pub const RETRY_AFTER_BOUND: Duration = Duration::from_secs(300);

/// The default policy: three retries with exponential backoff.
pub fn default_retry_policy() -> ExponentialBackoff {
    ExponentialBackoff::builder().build_with_max_retries(3)
}

/// A policy built from configuration values.
pub fn retry_policy(
    max_retries: u32,
    base_timeout: Duration,
    backoff_exponent: u32,
) -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(base_timeout, RETRY_AFTER_BOUND)
        .base(backoff_exponent.max(1))
        .build_with_max_retries(max_retries)
}

/// Returns true if the given HTTP status warrants a retry.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::PAYLOAD_TOO_LARGE
}

/// Returns true if the given transport error warrants a retry. Certificate
/// and other TLS setup problems are not retryable.
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    if error.is_builder() || error.is_redirect() {
        return false;
    }
    error.is_timeout()
        || error.is_connect()
        || error.is_request()
        || error
            .status()
            .map_or(false, is_retryable_status)
}

/// Extracts a `Retry-After` delay from a response, bounded by
/// [`RETRY_AFTER_BOUND`]. Both the seconds and the http-date form are
/// understood.
pub fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get(reqwest::header::RETRY_AFTER)?;
    let value = value.to_str().ok()?;
    let duration = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else {
        let when = httpdate_parse(value)?;
        when.duration_since(SystemTime::now()).ok()?
    };
    Some(duration.min(RETRY_AFTER_BOUND))
}

/// A minimal RFC 7231 http-date parser (`Tue, 01 Aug 2023 00:00:00 GMT`).
fn httpdate_parse(value: &str) -> Option<SystemTime> {
    let datetime = chrono_free_parse(value)?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(datetime))
}

/// Parses the fixed-format IMF date into a unix timestamp without pulling a
/// date-time dependency into this crate.
fn chrono_free_parse(value: &str) -> Option<u64> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let [_, day, month, year, time, zone] = parts.as_slice() else {
        return None;
    };
    if !zone.eq_ignore_ascii_case("GMT") {
        return None;
    }
    let day: u64 = day.parse().ok()?;
    let month = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ]
    .iter()
    .position(|m| m.eq_ignore_ascii_case(month))? as u64;
    let year: u64 = year.parse().ok()?;
    let mut time_parts = time.split(':');
    let hour: u64 = time_parts.next()?.parse().ok()?;
    let minute: u64 = time_parts.next()?.parse().ok()?;
    let second: u64 = time_parts.next()?.parse().ok()?;

    // Days since the epoch, using the civil-from-days algorithm.
    let year = year as i64;
    let month = month as i64 + 1;
    let day = day as i64;
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;
    if days < 0 {
        return None;
    }
    Some(days as u64 * 86_400 + hour * 3_600 + minute * 60 + second)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::PAYLOAD_TOO_LARGE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn test_http_date_parsing() {
        // 2023-08-01 00:00:00 UTC == 1690848000.
        assert_eq!(
            chrono_free_parse("Tue, 01 Aug 2023 00:00:00 GMT"),
            Some(1_690_848_000)
        );
        assert_eq!(chrono_free_parse("not a date"), None);
        assert_eq!(chrono_free_parse("Tue, 01 Aug 2023 00:00:00 CET"), None);
    }

    #[test]
    fn test_default_policy_retries() {
        let policy = default_retry_policy();
        let start = SystemTime::now();
        assert!(matches!(
            policy.should_retry(start, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 10),
            RetryDecision::DoNotRetry
        ));
    }
}
