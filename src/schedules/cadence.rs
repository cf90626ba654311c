//! Cadence math for schedules.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::schedules::model::Cadence;

/// Parse a cron expression.
///
/// Standard five-field expressions (`min hour dom month dow`) are accepted
/// and run at second zero; six and seven field expressions are passed
/// through unchanged.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron: {e}"))
}

/// Parse an IANA timezone name such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|_| format!("unknown timezone: {name}"))
}

/// Next cron occurrence strictly after `after`, evaluated in `timezone`.
pub fn next_cron_occurrence(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, String> {
    let schedule = parse_cron(expr)?;
    let tz = parse_timezone(timezone)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("cron expression {expr} has no upcoming occurrence"))
}

/// Compute the next run for a cadence claimed at `after`.
pub fn next_run_after(cadence: &Cadence, after: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    match cadence {
        Cadence::Interval { seconds } => Ok(after + chrono::Duration::seconds(*seconds as i64)),
        Cadence::Cron { expr, timezone } => next_cron_occurrence(expr, timezone, after),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn interval_adds_seconds() {
        let now = at(2026, 3, 1, 12, 0);
        let next = next_run_after(&Cadence::Interval { seconds: 90 }, now).unwrap();
        assert_eq!(next, at(2026, 3, 1, 12, 1) + chrono::Duration::seconds(30));
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn cron_is_strictly_after() {
        let now = at(2026, 3, 1, 12, 0);
        let next = next_cron_occurrence("0 * * * *", "UTC", now).unwrap();
        assert_eq!(next, at(2026, 3, 1, 13, 0));
    }

    #[test]
    fn cron_respects_timezone_and_dst() {
        // 09:00 in New York is 14:00 UTC in winter and 13:00 UTC in summer.
        let winter = next_cron_occurrence("0 9 * * *", "America/New_York", at(2026, 1, 15, 0, 0))
            .unwrap();
        assert_eq!(winter, at(2026, 1, 15, 14, 0));

        let summer = next_cron_occurrence("0 9 * * *", "America/New_York", at(2026, 7, 15, 0, 0))
            .unwrap();
        assert_eq!(summer, at(2026, 7, 15, 13, 0));
    }

    #[test]
    fn unknown_timezone_is_error() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(next_cron_occurrence("0 9 * * *", "Nowhere", Utc::now()).is_err());
    }
}
