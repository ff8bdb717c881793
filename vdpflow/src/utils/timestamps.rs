//! Timestamp helpers.
//!
//! Every timestamp that leaves the crate (DLQ records, outbox events,
//! breaker snapshots) is RFC 3339 in UTC.

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC time as an RFC 3339 string with millisecond
/// precision, e.g. `2025-08-20T20:25:00.123Z`.
///
/// # Examples
///
/// ```
/// use vdpflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with('Z'));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_rfc3339(&Utc::now())
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Formats a timestamp as RFC 3339 (UTC, millisecond precision).
#[must_use]
pub fn format_rfc3339(dt: &Timestamp) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimestampError::InvalidFormat(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_timestamp("2025-08-20T20:25:00Z").unwrap();
        assert_eq!(dt.year(), 2025);
        assert_eq!(dt.month(), 8);
        assert_eq!(dt.day(), 20);
    }

    #[test]
    fn test_parse_with_offset() {
        let dt = parse_timestamp("2025-08-21T05:25:00+09:00").unwrap();
        assert_eq!(dt.day(), 20);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(matches!(parse_timestamp("  "), Err(TimestampError::EmptyString)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(TimestampError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_iso_timestamp_roundtrips() {
        let ts = iso_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(parse_timestamp(&ts).is_ok());
    }
}
