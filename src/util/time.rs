//! Time helpers shared by storage and rendering.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};

use crate::error::{DeepqError, Result};

/// Fixed-width RFC3339 timestamp. Lexical order equals time order, which the
/// dequeue and lease queries rely on.
#[must_use]
pub fn to_db_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
///
/// # Errors
/// Returns `Storage` if the value is not RFC3339.
pub fn parse_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DeepqError::storage(&format!("bad timestamp '{value}'"), e))
}

/// Parse an optional stored timestamp.
///
/// # Errors
/// Returns `Storage` if a present value is not RFC3339.
pub fn parse_opt_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_db_timestamp).transpose()
}

/// Key of the daily budget scope containing `ts`.
#[must_use]
pub fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Key of the monthly budget scope containing `ts`.
#[must_use]
pub fn month_key(ts: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// Format a relative time (past or future).
#[must_use]
pub fn format_relative_time(target: DateTime<Utc>) -> String {
    let now = Utc::now();
    let duration = now.signed_duration_since(target);

    if duration.num_seconds().abs() < 60 {
        return "just now".to_string();
    }

    let minutes = duration.num_minutes().abs();
    let hours = duration.num_hours().abs();
    let days = duration.num_days().abs();

    let suffix = if duration.num_seconds() > 0 {
        "ago"
    } else {
        "from now"
    };

    if days > 0 {
        format!("{days} day{} {suffix}", if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("{hours} hour{} {suffix}", if hours == 1 { "" } else { "s" })
    } else {
        format!(
            "{minutes} minute{} {suffix}",
            if minutes == 1 { "" } else { "s" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn db_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = a + Duration::milliseconds(1500);
        let (sa, sb) = (to_db_timestamp(a), to_db_timestamp(b));
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(parse_db_timestamp(&sb).unwrap(), b);
    }

    #[test]
    fn scope_keys() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(day_key(ts), "2026-03-07");
        assert_eq!(month_key(ts), "2026-03");
    }

    #[test]
    fn relative_time_past() {
        let target = Utc::now() - Duration::hours(3);
        assert_eq!(format_relative_time(target), "3 hours ago");
    }

    #[test]
    fn bad_timestamp_is_storage_error() {
        assert!(matches!(
            parse_db_timestamp("yesterday"),
            Err(DeepqError::Storage(_))
        ));
    }
}
