//! Conversion between the platform's `seconds[.fraction]` timestamp tokens and
//! canonical UTC instants.

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("empty timestamp token")]
    Empty,
    #[error("invalid seconds in timestamp token {0:?}")]
    InvalidSeconds(String),
    #[error("invalid fraction in timestamp token {0:?}")]
    InvalidFraction(String),
    #[error("timestamp token {0:?} is out of range")]
    OutOfRange(String),
}

/// Parse a token such as `"1717691574.123456"` into a UTC instant.
///
/// The fractional part is right-padded (or truncated) to nanoseconds, so
/// `"10.5"` is ten and a half seconds after the epoch.
pub fn parse_token(token: &str) -> Result<DateTime<Utc>, TimestampError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TimestampError::Empty);
    }

    let (secs_part, frac_part) = match token.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (token, ""),
    };

    let secs = secs_part
        .parse::<i64>()
        .map_err(|_| TimestampError::InvalidSeconds(token.to_string()))?;

    let nanos = if frac_part.is_empty() {
        0
    } else {
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimestampError::InvalidFraction(token.to_string()));
        }
        let mut digits: String = frac_part.chars().take(9).collect();
        while digits.len() < 9 {
            digits.push('0');
        }
        digits
            .parse::<u32>()
            .map_err(|_| TimestampError::InvalidFraction(token.to_string()))?
    };

    DateTime::from_timestamp(secs, nanos).ok_or_else(|| TimestampError::OutOfRange(token.to_string()))
}

/// Render an instant in the form stored in the ledger (RFC 3339, microseconds, `Z`).
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_seconds_and_micros() {
        let t = parse_token("1717691574.123456").unwrap();
        assert_eq!(t.timestamp(), 1_717_691_574);
        assert_eq!(t.timestamp_subsec_micros(), 123_456);
    }

    #[test]
    fn parses_whole_seconds_without_fraction() {
        let t = parse_token("100").unwrap();
        assert_eq!(t.timestamp(), 100);
        assert_eq!(t.nanosecond(), 0);
    }

    #[test]
    fn short_fraction_is_right_padded() {
        let t = parse_token("10.5").unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn long_fraction_is_truncated_to_nanos() {
        let t = parse_token("1.1234567891234").unwrap();
        assert_eq!(t.nanosecond(), 123_456_789);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_token(""), Err(TimestampError::Empty));
        assert!(matches!(parse_token("not-a-ts"), Err(TimestampError::InvalidSeconds(_))));
        assert!(matches!(parse_token("12.ab"), Err(TimestampError::InvalidFraction(_))));
    }

    #[test]
    fn formatted_instant_keeps_calendar_date() {
        let t = parse_token("1717691574.000001").unwrap();
        let rendered = format_instant(t);
        assert_eq!(rendered, "2024-06-06T16:32:54.000001Z");
        assert_eq!(t.date_naive().day(), 6);
    }
}
