//! Deterministic cron fallback (v0.1)
//!
//! Five-field expressions supporting `*`, `*/n` and single values, with
//! day-of-week 0–7 (7 aliases to 0 = Sunday). Field stepping fast-forwards
//! whole months/days/hours, so even unsatisfiable expressions (Feb 31)
//! resolve quickly - to `schedule.noMatch` after a five-year horizon.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use super::DurableError;

/// Search horizon before declaring an expression unsatisfiable
const HORIZON_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    Exact(u32),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => value % n == 0,
            Field::Exact(v) => value == *v,
        }
    }

    fn is_restricted(&self) -> bool {
        !matches!(self, Field::Any)
    }
}

/// A parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    /// Parse `minute hour day-of-month month day-of-week`
    pub fn parse(expr: &str) -> Result<Self, DurableError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(DurableError::ScheduleConfig {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }

        let parse_field = |raw: &str, min: u32, max: u32| -> Result<Field, DurableError> {
            let invalid = |reason: String| DurableError::ScheduleConfig {
                expr: expr.to_string(),
                reason,
            };
            if raw == "*" {
                return Ok(Field::Any);
            }
            if let Some(step) = raw.strip_prefix("*/") {
                let n: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("invalid step '{}'", raw)))?;
                if n == 0 {
                    return Err(invalid("step of zero".into()));
                }
                return Ok(Field::Step(n));
            }
            let v: u32 = raw
                .parse()
                .map_err(|_| invalid(format!("invalid value '{}'", raw)))?;
            if v < min || v > max {
                return Err(invalid(format!(
                    "value {} out of range {}..={}",
                    v, min, max
                )));
            }
            Ok(Field::Exact(v))
        };

        let minute = parse_field(fields[0], 0, 59)?;
        let hour = parse_field(fields[1], 0, 23)?;
        let day_of_month = parse_field(fields[2], 1, 31)?;
        let month = parse_field(fields[3], 1, 12)?;
        // Day-of-week allows 0–7; 7 aliases to Sunday.
        let day_of_week = match parse_field(fields[4], 0, 7)? {
            Field::Exact(7) => Field::Exact(0),
            other => other,
        };

        Ok(Self {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        })
    }

    /// Classic cron day rule: when both day fields are restricted, either
    /// may match; otherwise both apply.
    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.matches(t.day());
        let dow = self.day_of_week.matches(t.weekday().num_days_from_sunday());
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The first matching time strictly after `from`, at second zero
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, DurableError> {
        let mut t = truncate_to_minute(from) + Duration::minutes(1);
        let limit = from + Duration::days(HORIZON_DAYS);

        while t <= limit {
            if !self.month.matches(t.month()) {
                t = start_of_next_month(&t);
                continue;
            }
            if !self.day_matches(&t) {
                t = start_of_next_day(&t);
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = start_of_next_hour(&t);
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Ok(t);
        }

        Err(DurableError::ScheduleNoMatch {
            expr: format!("{:?}", self),
        })
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
        .unwrap_or(t)
}

fn start_of_next_hour(t: &DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(*t - Duration::minutes(t.minute() as i64)) + Duration::hours(1)
}

fn start_of_next_day(t: &DateTime<Utc>) -> DateTime<Utc> {
    let midnight = Utc
        .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(*t);
    midnight + Duration::days(1)
}

fn start_of_next_month(t: &DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(*t + Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        let from = at(2025, 3, 10, 14, 2, 30);
        let next = cron.next_after(from).unwrap();

        assert!(next > from);
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);
        assert_eq!(next, at(2025, 3, 10, 14, 5, 0));
    }

    #[test]
    fn next_is_strictly_after_even_on_a_match() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        let from = at(2025, 3, 10, 14, 5, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2025, 3, 10, 14, 10, 0));
    }

    #[test]
    fn exact_daily_time() {
        let cron = CronExpr::parse("30 9 * * *").unwrap();
        let next = cron.next_after(at(2025, 3, 10, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 11, 9, 30, 0));
    }

    #[test]
    fn day_of_week_seven_aliases_to_sunday() {
        let on_seven = CronExpr::parse("0 12 * * 7").unwrap();
        let on_zero = CronExpr::parse("0 12 * * 0").unwrap();
        assert_eq!(on_seven, on_zero);

        // 2025-03-10 is a Monday; next Sunday noon is 2025-03-16.
        let next = on_seven.next_after(at(2025, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 16, 12, 0, 0));
    }

    #[test]
    fn month_fast_forward() {
        let cron = CronExpr::parse("0 0 1 6 *").unwrap();
        let next = cron.next_after(at(2025, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 1, 0, 0, 0));
    }

    #[test]
    fn feb_31_is_unsatisfiable() {
        let cron = CronExpr::parse("0 0 31 2 *").unwrap();
        let err = cron.next_after(at(2025, 1, 1, 0, 0, 0)).unwrap_err();
        assert_eq!(err.kind(), "schedule.noMatch");
    }

    #[test]
    fn malformed_expressions_fail_config() {
        for bad in ["* * * *", "x * * * *", "*/0 * * * *", "61 * * * *", "* * * * 8"] {
            let err = CronExpr::parse(bad).unwrap_err();
            assert_eq!(err.kind(), "schedule.config", "expected config error for {bad}");
        }
    }

    #[test]
    fn both_day_fields_restricted_use_or_semantics() {
        // Day 15 of the month OR any Sunday; from Monday 2025-03-10 the
        // 15th (a Saturday) comes before the next Sunday (the 16th).
        let cron = CronExpr::parse("0 0 15 * 0").unwrap();
        let next = cron.next_after(at(2025, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 15, 0, 0, 0));
    }
}
