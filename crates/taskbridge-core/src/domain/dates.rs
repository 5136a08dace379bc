//! Canonical `YYYY-MM-DD` date handling.
//!
//! Both universes transmit dates in slightly different shapes (bare dates,
//! ISO date-times with or without offsets); everything is normalized to a
//! calendar day before comparison.

use chrono::NaiveDate;

/// Parses a date string to a calendar day.
///
/// Accepts `YYYY-MM-DD` and ISO-8601 date-times, which are truncated to
/// their date part. Returns `None` for empty or malformed input.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.len() < 10 {
        return None;
    }
    NaiveDate::parse_from_str(&trimmed[..10], "%Y-%m-%d").ok()
}

/// Normalizes a date string to canonical `YYYY-MM-DD`, or `None` if it does
/// not denote a valid date.
pub fn normalize_date_string(raw: &str) -> Option<String> {
    parse_date(raw).map(|d| format_date(d))
}

/// Formats a calendar day in the canonical form.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// True when both dates are present and denote the same day.
///
/// Two absent dates are *not* equal: callers that want "nothing to sync"
/// semantics for double-absence handle that case explicitly.
pub fn dates_equal(a: Option<NaiveDate>, b: Option<NaiveDate>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

/// Absolute distance in days, or `None` when either side is missing.
pub fn date_distance_days(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some((x - y).num_days().abs()),
        _ => None,
    }
}
