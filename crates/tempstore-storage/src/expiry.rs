//! Human-readable time-until-expiry

use chrono::{DateTime, Duration, Utc};

use crate::structured::VersionRecord;

/// Describe how long until something expires, rounded to the largest
/// sensible unit: "expired", "expires in 45 seconds", "expires in 3 days".
pub fn describe_expiry(seconds_left: i64) -> String {
    if seconds_left <= 0 {
        return "expired".to_string();
    }
    format!("expires in {}", approximate(seconds_left))
}

/// Expiry description for a version under a retention window
pub fn describe_version(record: &VersionRecord, retention: Duration, now: DateTime<Utc>) -> String {
    if record.starred {
        return "starred".to_string();
    }
    match record.created_at().checked_add_signed(retention) {
        Some(expires_at) => describe_expiry((expires_at - now).num_seconds()),
        None => "never expires".to_string(),
    }
}

fn approximate(seconds: i64) -> String {
    if seconds < 60 {
        return unit(seconds, "second");
    }
    let minutes = seconds.saturating_add(30) / 60;
    if minutes < 60 {
        return unit(minutes, "minute");
    }
    let hours = (minutes + 30) / 60;
    if hours < 24 {
        return unit(hours, "hour");
    }
    unit((hours + 12) / 24, "day")
}

fn unit(value: i64, name: &str) -> String {
    let plural = if value > 1 { "s" } else { "" };
    format!("{value} {name}{plural}")
}
