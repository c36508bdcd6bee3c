//! Timestamp utilities

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a date string as stored by the external store.
///
/// Accepts RFC 3339 timestamps (`2022-10-14T12:15:05.000+08:00`) and bare
/// dates (`2022-10-14`, interpreted as UTC midnight).
pub fn parse_store_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Format a timestamp the way the store expects it
pub fn format_store_date(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
