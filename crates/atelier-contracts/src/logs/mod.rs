pub mod aggregate;
pub mod purge;
pub mod writer;

use chrono::{DateTime, FixedOffset};

/// Marker used whenever a record carries no user.
pub const ANONYMOUS_USER: &str = "(anonymous)";

/// The fixed civil time zone (UTC+9) every timestamp is written in and every
/// date/month bucket is derived in.
pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("UTC+9 is a valid offset")
}

/// Parses a record timestamp and pins it to the civil time zone.
pub fn parse_ts(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|ts| ts.with_timezone(&jst()))
}

/// Year-month bucket (`YYYY-MM`) of a record timestamp, `None` when the
/// timestamp does not parse.
pub fn month_bucket(value: &str) -> Option<String> {
    parse_ts(value).map(|ts| ts.format("%Y-%m").to_string())
}
