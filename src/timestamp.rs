//! 14-digit archive timestamps (`YYYYMMDDHHMMSS`, UTC).

use crate::error::ArchiveError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};

/// Format used by both CDX backends and replay URLs.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Parses a full 14-digit timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ArchiveError> {
    if value.len() != 14 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ArchiveError::Validation(format!(
            "expected a 14 digit timestamp, got '{}'",
            value
        )));
    }
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|ts| ts.and_utc())
        .map_err(|_| ArchiveError::Validation(format!("invalid timestamp '{}'", value)))
}

/// Formats an instant as a 14-digit timestamp.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Returns the earliest and latest instants covered by a timestamp prefix.
///
/// CDX servers accept any prefix of the 14-digit form, so `"202001"` covers
/// all of January 2020 and `"20201"` covers October to December. The prefix
/// must hold at least a year.
pub fn timestamp_bounds(prefix: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), ArchiveError> {
    if prefix.len() < 4 || prefix.len() > 14 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ArchiveError::Validation(format!(
            "invalid timestamp prefix '{}'",
            prefix
        )));
    }
    let lower = padded_instant(prefix, '0')?;
    let upper = padded_instant(prefix, '9')?;
    Ok((lower, upper))
}

/// Pads a prefix to 14 digits and clamps every field into range.
fn padded_instant(prefix: &str, fill: char) -> Result<DateTime<Utc>, ArchiveError> {
    let mut digits = prefix.to_string();
    while digits.len() < 14 {
        digits.push(fill);
    }
    let field = |range: std::ops::Range<usize>| -> u32 { digits[range].parse().unwrap_or(0) };

    let year: i32 = digits[0..4].parse().unwrap_or(0);
    let month = field(4..6).clamp(1, 12);
    let last_day = last_day_of_month(year, month).ok_or_else(|| {
        ArchiveError::Validation(format!("timestamp prefix '{}' is out of range", prefix))
    })?;
    let day = field(6..8).clamp(1, last_day);

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(field(8..10).min(23), field(10..12).min(59), field(12..14).min(59)))
        .map(|ts| ts.and_utc())
        .ok_or_else(|| {
            ArchiveError::Validation(format!("timestamp prefix '{}' is out of range", prefix))
        })
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.pred_opt().map(|d| d.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_full_timestamp() {
        let ts = parse_timestamp("20200115123005").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2020, 1, 15, 12, 30, 5).unwrap());
        assert_eq!(format_timestamp(&ts), "20200115123005");
    }

    #[test]
    fn test_parse_rejects_partial_and_garbage() {
        assert!(parse_timestamp("202001").is_err());
        assert!(parse_timestamp("2020011512300x").is_err());
        let err = parse_timestamp("20201315123005").unwrap_err();
        assert!(err.to_string().contains("20201315123005"));
    }

    #[test]
    fn test_prefix_bounds() {
        let (lower, upper) = timestamp_bounds("2020").unwrap();
        assert_eq!(lower, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(upper, Utc.with_ymd_and_hms(2020, 12, 31, 23, 59, 59).unwrap());

        let (lower, upper) = timestamp_bounds("202002").unwrap();
        assert_eq!(lower, Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(upper, Utc.with_ymd_and_hms(2020, 2, 29, 23, 59, 59).unwrap());

        let (lower, upper) = timestamp_bounds("2021121508").unwrap();
        assert_eq!(lower, Utc.with_ymd_and_hms(2021, 12, 15, 8, 0, 0).unwrap());
        assert_eq!(upper, Utc.with_ymd_and_hms(2021, 12, 15, 8, 59, 59).unwrap());
    }

    #[test]
    fn test_prefix_with_partial_field() {
        let (lower, upper) = timestamp_bounds("20201").unwrap();
        assert_eq!(lower, Utc.with_ymd_and_hms(2020, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(upper, Utc.with_ymd_and_hms(2020, 12, 31, 23, 59, 59).unwrap());

        let (lower, upper) = timestamp_bounds("20200").unwrap();
        assert_eq!(lower, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(upper, Utc.with_ymd_and_hms(2020, 9, 30, 23, 59, 59).unwrap());

        let (lower, upper) = timestamp_bounds("2021021").unwrap();
        assert_eq!(lower, Utc.with_ymd_and_hms(2021, 2, 10, 0, 0, 0).unwrap());
        assert_eq!(upper, Utc.with_ymd_and_hms(2021, 2, 19, 23, 59, 59).unwrap());

        let (_, upper) = timestamp_bounds("202102151").unwrap();
        assert_eq!(upper, Utc.with_ymd_and_hms(2021, 2, 15, 19, 59, 59).unwrap());
    }

    #[test]
    fn test_prefix_rejects_short_or_non_digit() {
        assert!(timestamp_bounds("202").is_err());
        assert!(timestamp_bounds("").is_err());
        assert!(timestamp_bounds("2020-01").is_err());
        assert!(timestamp_bounds("202001011200000").is_err());
    }
}
