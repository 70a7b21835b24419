//! Utility functions.

pub mod time;

pub use time::{day_key, format_relative_time, month_key, parse_db_timestamp, to_db_timestamp};
