//! Thin wrapper over the `cron` crate: the two primitives spec.md §4.6
//! requires (`IsValid`, `NextOccurrence`), plus a human description used
//! only for display.

use crate::error::{CronError, CronResult};
use chrono::{DateTime, Utc};
use chrono_tz::UTC;
use cron::Schedule;
use std::str::FromStr;

/// True iff `expr` parses as a standard 5-field UNIX cron expression
/// (spec.md §4.6).
pub fn is_valid(expr: &str) -> bool {
    Schedule::from_str(expr).is_ok()
}

/// Next fire time strictly after `after` (spec.md §4.6). Schedules run in
/// UTC; the `cron` crate's own 6-field seconds extension is accepted
/// because the underlying parser supports it, but every workflow written
/// against this daemon uses the 5-field form.
pub fn next_occurrence(expr: &str, after: DateTime<Utc>) -> CronResult<Option<DateTime<Utc>>> {
    let schedule = parse(expr)?;
    let after_tz = after.with_timezone(&UTC);
    Ok(schedule.after(&after_tz).next().map(|dt| dt.with_timezone(&Utc)))
}

/// A short human-readable description of the schedule, for display only
/// (spec.md §4.6: "the parser also returns a human description used only
/// for display").
pub fn describe(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() < 5 {
        return format!("invalid cron expression: {expr}");
    }
    let (min, hour, dom, mon, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
    match (min, hour, dom, mon, dow) {
        ("*", "*", "*", "*", "*") => "every minute".to_string(),
        (m, "*", "*", "*", "*") if m != "*" => format!("at minute {m} of every hour"),
        (m, h, "*", "*", "*") if m != "*" && h != "*" => format!("daily at {h}:{m}"),
        (m, h, "*", "*", d) if m != "*" && h != "*" && d != "*" => {
            format!("weekly on day {d} at {h}:{m}")
        }
        (m, h, d, "*", "*") if m != "*" && h != "*" && d != "*" => {
            format!("monthly on day {d} at {h}:{m}")
        }
        _ => format!("custom schedule ({expr})"),
    }
}

fn parse(expr: &str) -> CronResult<Schedule> {
    Schedule::from_str(expr).map_err(|e| CronError::InvalidCronExpression(expr.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_malformed_expression() {
        assert!(!is_valid("not a cron expr"));
        assert!(is_valid("0 0 * * *"));
    }

    #[test]
    fn next_occurrence_is_strictly_after_the_given_time() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_occurrence("0 0 * * *", after).unwrap().unwrap();
        assert!(next > after);
        assert_eq!(next.format("%H:%M").to_string(), "00:00");
    }

    #[test]
    fn describe_is_stable_for_common_shapes() {
        assert_eq!(describe("* * * * *"), "every minute");
        assert_eq!(describe("30 2 * * *"), "daily at 2:30");
    }
}
