//! Cron engine: 5-field expressions, evaluated in UTC.
//!
//! Wall-clock UTC drives every computation here; monotonic time is only
//! used elsewhere for timeout accounting.

use std::str::FromStr;

use chrono::{NaiveDateTime, TimeZone, Utc};
use cron::Schedule;

use crate::error::{AppError, AppResult};

/// Parse a standard 5-field cron expression (minute, hour, day-of-month,
/// month, day-of-week). The underlying parser wants a seconds field, so a
/// literal `0` is prepended; user expressions never carry seconds.
fn parse(expr: &str) -> AppResult<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(AppError::InvalidCron(format!(
            "'{expr}': expected 5 fields, got {fields}"
        )));
    }

    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| AppError::InvalidCron(format!("'{expr}': {e}")))
}

/// Validate an expression without computing anything.
pub fn validate(expr: &str) -> AppResult<()> {
    parse(expr).map(|_| ())
}

/// The next fire instant strictly after `after`, in UTC.
///
/// Fails with `InvalidCron` for malformed expressions and `NoFutureFire`
/// when the expression can never match again (e.g. a day-of-month that does
/// not exist) — always reported, never silently defaulted.
pub fn next_fire(expr: &str, after: NaiveDateTime) -> AppResult<NaiveDateTime> {
    let schedule = parse(expr)?;
    let after_utc = Utc.from_utc_datetime(&after);

    schedule
        .after(&after_utc)
        .next()
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| AppError::NoFutureFire(expr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn daily_at_nine_fires_next_morning() {
        let after = at(2025, 6, 1, 9, 0, 0);
        let next = next_fire("0 9 * * *", after).unwrap();
        assert_eq!(next, at(2025, 6, 2, 9, 0, 0));
    }

    #[test]
    fn next_fire_is_strictly_greater_than_reference() {
        // Reference exactly on a match must roll to the following instant.
        let on_the_mark = at(2025, 6, 1, 9, 0, 0);
        let next = next_fire("0 9 * * *", on_the_mark).unwrap();
        assert!(next > on_the_mark);
    }

    #[test]
    fn supports_steps_lists_and_ranges() {
        let after = at(2025, 6, 1, 0, 7, 0);
        assert_eq!(next_fire("*/15 * * * *", after).unwrap(), at(2025, 6, 1, 0, 15, 0));

        let after = at(2025, 6, 1, 10, 0, 0);
        assert_eq!(next_fire("0 9,18 * * *", after).unwrap(), at(2025, 6, 1, 18, 0, 0));

        // Mon-Fri only: Jun 6 2025 is a Friday, so the range skips to Monday.
        let after = at(2025, 6, 6, 12, 0, 0);
        assert_eq!(
            next_fire("0 9 * * Mon-Fri", after).unwrap(),
            at(2025, 6, 9, 9, 0, 0)
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(matches!(
            next_fire("not a cron", at(2025, 1, 1, 0, 0, 0)),
            Err(AppError::InvalidCron(_))
        ));
        assert!(matches!(
            next_fire("0 9 * *", at(2025, 1, 1, 0, 0, 0)),
            Err(AppError::InvalidCron(_))
        ));
        assert!(matches!(
            next_fire("0 9 * * * *", at(2025, 1, 1, 0, 0, 0)),
            Err(AppError::InvalidCron(_))
        ));
        assert!(matches!(validate("61 * * * *"), Err(AppError::InvalidCron(_))));
    }

    #[test]
    fn unsatisfiable_expression_is_reported() {
        // February 30th never exists.
        assert!(matches!(
            next_fire("0 0 30 2 *", at(2025, 1, 1, 0, 0, 0)),
            Err(AppError::NoFutureFire(_))
        ));
    }

    #[test]
    fn leap_day_schedules_skip_to_leap_years() {
        let after = at(2025, 1, 1, 0, 0, 0);
        let next = next_fire("0 0 29 2 *", after).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0, 0));
    }
}
