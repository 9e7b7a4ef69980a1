//! Five-field cron evaluation.
//!
//! Task definitions use standard Unix cron syntax
//! (`minute hour day-of-month month day-of-week`). The `cron` crate expects a
//! leading seconds field and numbers weekdays `1-7` from Sunday, so
//! expressions are normalized before parsing: seconds are pinned to `0` and
//! the day-of-week field is rewritten into explicit weekday names.
//!
//! When both day fields are restricted, a time matches if either one does,
//! as in Vixie cron. The `cron` crate requires both, so such expressions are
//! split into one schedule per day field and their occurrences merged.

use std::collections::BTreeSet;
use std::iter::Peekable;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::CronError;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed five-field expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    primary: Schedule,
    /// Day-of-week half of an expression that restricts both day fields.
    by_weekday: Option<Schedule>,
}

impl CronSchedule {
    /// Occurrences strictly after `from`, in ascending order.
    pub fn after<'a>(&'a self, from: &DateTime<Utc>) -> Occurrences<'a> {
        Occurrences {
            primary: boxed(&self.primary, from),
            by_weekday: self.by_weekday.as_ref().map(|s| boxed(s, from)),
        }
    }
}

type TimeIter<'a> = Peekable<Box<dyn Iterator<Item = DateTime<Utc>> + 'a>>;

fn boxed<'a>(schedule: &'a Schedule, from: &DateTime<Utc>) -> TimeIter<'a> {
    let iter: Box<dyn Iterator<Item = DateTime<Utc>> + 'a> = Box::new(schedule.after(from));
    iter.peekable()
}

/// Ascending, de-duplicated union of one or two schedules.
pub struct Occurrences<'a> {
    primary: TimeIter<'a>,
    by_weekday: Option<TimeIter<'a>>,
}

impl Iterator for Occurrences<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(other) = self.by_weekday.as_mut() else {
            return self.primary.next();
        };
        match (self.primary.peek().copied(), other.peek().copied()) {
            (Some(a), Some(b)) if a < b => self.primary.next(),
            (Some(a), Some(b)) if b < a => other.next(),
            (Some(_), Some(_)) => {
                other.next();
                self.primary.next()
            }
            (Some(_), None) => self.primary.next(),
            (None, _) => other.next(),
        }
    }
}

/// Parse a five-field expression into a schedule.
pub fn parse(expression: &str) -> Result<CronSchedule, CronError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::new(
            expression,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);

    let day_of_week =
        normalize_day_of_week(fields[4]).map_err(|message| CronError::new(expression, message))?;
    let build = |dom: &str, dow: &str| {
        Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
            .map_err(|e| CronError::new(expression, e.to_string()))
    };

    if is_unrestricted(day_of_month) || day_of_week == "*" {
        let day_of_month = if is_unrestricted(day_of_month) { "*" } else { day_of_month };
        return Ok(CronSchedule {
            primary: build(day_of_month, &day_of_week)?,
            by_weekday: None,
        });
    }

    Ok(CronSchedule {
        primary: build(day_of_month, "*")?,
        by_weekday: Some(build("*", &day_of_week)?),
    })
}

/// Check an expression without evaluating it.
pub fn validate(expression: &str) -> Result<(), CronError> {
    parse(expression).map(|_| ())
}

/// Earliest instant strictly after `from` that satisfies `expression`.
pub fn next_due(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    parse(expression)?
        .after(&from)
        .next()
        .ok_or_else(|| CronError::new(expression, "expression has no future occurrence"))
}

/// The next `count` due instants after `from`.
pub fn upcoming(
    expression: &str,
    count: usize,
    from: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, CronError> {
    Ok(parse(expression)?.after(&from).take(count).collect())
}

fn is_unrestricted(field: &str) -> bool {
    field == "*" || field == "?"
}

/// Rewrite a day-of-week field into an explicit list of weekday names.
///
/// Accepts `0-7` (both 0 and 7 are Sunday), `SUN`-`SAT`, lists, ranges and
/// steps. A bare `*` or `?` passes through.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if is_unrestricted(field) {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (weekday_number(lo)?, weekday_number(hi)?)
        } else {
            let day = weekday_number(range)?;
            // `5/2` means "from Friday, every other day" in Unix cron.
            if step.is_some() { (day, 7) } else { (day, day) }
        };

        if start > end {
            return Err(format!("day-of-week range '{range}' is reversed"));
        }

        let mut day = start;
        while day <= end {
            days.insert(day % 7);
            day += step.unwrap_or(1);
        }
    }

    Ok(days
        .into_iter()
        .map(|d| WEEKDAYS[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

fn weekday_number(token: &str) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week value {n} out of range 0-7"))
        };
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|i| i as u32)
        .ok_or_else(|| format!("invalid day-of-week '{token}'"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_five_minutes_from_midnight() {
        let next = next_due("*/5 * * * *", at(2026, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 1, 1, 0, 5, 0));
    }

    #[test]
    fn next_due_is_strictly_after() {
        let next = next_due("*/5 * * * *", at(2026, 1, 1, 0, 5, 0)).unwrap();
        assert_eq!(next, at(2026, 1, 1, 0, 10, 0));

        let next = next_due("*/5 * * * *", at(2026, 1, 1, 0, 4, 59)).unwrap();
        assert_eq!(next, at(2026, 1, 1, 0, 5, 0));
    }

    #[test]
    fn weekday_range_uses_unix_numbering() {
        // 2026-01-03 is a Saturday; 1-5 is Monday to Friday.
        let next = next_due("0 9 * * 1-5", at(2026, 1, 3, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 1, 5, 9, 0, 0));
    }

    #[test]
    fn sunday_is_zero_and_seven() {
        // 2026-01-01 is a Thursday.
        let from = at(2026, 1, 1, 0, 0, 0);
        let sunday = at(2026, 1, 4, 0, 0, 0);
        assert_eq!(next_due("0 0 * * 0", from).unwrap(), sunday);
        assert_eq!(next_due("0 0 * * 7", from).unwrap(), sunday);
        assert_eq!(next_due("0 0 * * sun", from).unwrap(), sunday);
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // 2026-01-05 is the first Monday; the 15th is a Thursday.
        let from = at(2026, 1, 1, 0, 0, 0);
        assert_eq!(next_due("0 0 15 * 1", from).unwrap(), at(2026, 1, 5, 0, 0, 0));
        assert_eq!(
            next_due("0 0 15 * 1", at(2026, 1, 12, 0, 0, 0)).unwrap(),
            at(2026, 1, 15, 0, 0, 0)
        );

        let times = upcoming("0 0 15 * 1", 5, from).unwrap();
        assert_eq!(
            times,
            vec![
                at(2026, 1, 5, 0, 0, 0),
                at(2026, 1, 12, 0, 0, 0),
                at(2026, 1, 15, 0, 0, 0),
                at(2026, 1, 19, 0, 0, 0),
                at(2026, 1, 26, 0, 0, 0),
            ]
        );
    }

    #[test]
    fn day_matching_both_fields_fires_once() {
        // 2026-06-15 is a Monday.
        let times = upcoming("0 0 15 6 1", 4, at(2026, 6, 14, 0, 0, 0)).unwrap();
        assert_eq!(
            times,
            vec![
                at(2026, 6, 15, 0, 0, 0),
                at(2026, 6, 22, 0, 0, 0),
                at(2026, 6, 29, 0, 0, 0),
                at(2027, 6, 7, 0, 0, 0),
            ]
        );
    }

    #[test]
    fn single_restricted_day_field_is_unchanged() {
        let from = at(2026, 1, 1, 0, 0, 0);
        assert_eq!(next_due("0 0 15 * *", from).unwrap(), at(2026, 1, 15, 0, 0, 0));
        assert_eq!(next_due("0 0 ? * MON", from).unwrap(), at(2026, 1, 5, 0, 0, 0));
    }

    #[test]
    fn day_of_week_normalization() {
        assert_eq!(normalize_day_of_week("*").unwrap(), "*");
        assert_eq!(normalize_day_of_week("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(normalize_day_of_week("5-7").unwrap(), "SUN,FRI,SAT");
        assert_eq!(normalize_day_of_week("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(normalize_day_of_week("MON,wed").unwrap(), "MON,WED");
        assert!(normalize_day_of_week("8").is_err());
        assert!(normalize_day_of_week("5-1").is_err());
        assert!(normalize_day_of_week("*/0").is_err());
        assert!(normalize_day_of_week("FUNDAY").is_err());
    }

    #[test]
    fn invalid_expressions_carry_the_original_text() {
        for expr in ["invalid", "60 * * * *", "* * * *", "0 0 * * * *", "* * 32 * *"] {
            let err = next_due(expr, Utc::now()).unwrap_err();
            assert_eq!(err.expression, expr);
            assert!(!err.message.is_empty());
        }
    }

    #[test]
    fn validate_accepts_common_forms() {
        assert!(validate("0 0 * * *").is_ok());
        assert!(validate("*/15 * * * *").is_ok());
        assert!(validate("30 4 1 * *").is_ok());
        assert!(validate("0 9 * JAN-MAR MON-FRI").is_ok());
    }

    #[test]
    fn upcoming_returns_count_in_order() {
        let times = upcoming("*/10 * * * *", 3, at(2026, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(
            times,
            vec![
                at(2026, 1, 1, 0, 10, 0),
                at(2026, 1, 1, 0, 20, 0),
                at(2026, 1, 1, 0, 30, 0),
            ]
        );
    }
}
