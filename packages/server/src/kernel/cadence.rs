//! Cadence evaluator: when does a recurring schedule fire next?
//!
//! Accepts standard 5-field cron (`minute hour day-of-month month
//! day-of-week`) and the shorthand `DAILY@H[:MM]`, which means `MM H * * *`.
//! Everything is evaluated in UTC. Day-of-month and day-of-week restrictions
//! must both match (AND), so `0 0 13 * 5` is "Friday the 13th".

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref DAILY_REGEX: Regex =
        Regex::new(r"(?i)^DAILY@(\d{1,2})(?::(\d{2}))?$").unwrap();
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CadenceError {
    #[error("empty cadence expression")]
    Empty,

    #[error("expected 5 cron fields, found {0}")]
    FieldCount(usize),

    #[error("invalid DAILY time in {0:?} (expected DAILY@H[:MM])")]
    DailyTime(String),

    #[error("invalid day-of-week field {0:?}")]
    Weekday(String),

    #[error("invalid cron expression {expr:?}: {message}")]
    Cron { expr: String, message: String },

    #[error("cron expression {0:?} never fires")]
    NeverFires(String),
}

/// A parsed, validated schedule.
#[derive(Debug, Clone)]
pub struct Cadence {
    source: String,
    expression: String,
    schedule: cron::Schedule,
}

impl Cadence {
    pub fn parse(expr: &str) -> Result<Self, CadenceError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(CadenceError::Empty);
        }

        let is_daily = trimmed
            .get(..6)
            .map(|prefix| prefix.eq_ignore_ascii_case("DAILY@"))
            .unwrap_or(false);
        let expression = if is_daily {
            daily_expression(trimmed)?
        } else {
            cron_expression(trimmed)?
        };

        let schedule =
            cron::Schedule::from_str(&expression).map_err(|e| CadenceError::Cron {
                expr: trimmed.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            source: trimmed.to_string(),
            expression,
            schedule,
        })
    }

    /// The expression as written by the operator.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Seconds-first 6-field form, as understood by `tokio-cron-scheduler`.
    pub fn scheduler_expression(&self) -> &str {
        &self.expression
    }

    /// First fire strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fires in `(after, until]`, oldest first.
    pub fn fires_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.schedule
            .after(&after)
            .take_while(move |fire| *fire <= until)
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cadence::parse(s)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Next fire of `expr` strictly after `now`.
pub fn next_fire(now: DateTime<Utc>, expr: &str) -> Result<DateTime<Utc>, CadenceError> {
    let cadence = Cadence::parse(expr)?;
    cadence
        .next_fire(now)
        .ok_or_else(|| CadenceError::NeverFires(cadence.source))
}

fn daily_expression(expr: &str) -> Result<String, CadenceError> {
    let invalid = || CadenceError::DailyTime(expr.to_string());
    let caps = DAILY_REGEX.captures(expr).ok_or_else(invalid)?;

    let hour: u32 = caps[1].parse().map_err(|_| invalid())?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().map_err(|_| invalid())?,
        None => 0,
    };
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }

    Ok(format!("0 {} {} * * *", minute, hour))
}

fn cron_expression(expr: &str) -> Result<String, CadenceError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CadenceError::FieldCount(fields.len()));
    }

    let weekdays = translate_weekdays(fields[4])?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekdays
    ))
}

/// Rewrites a standard day-of-week field (0 or 7 = Sunday, names allowed)
/// as an explicit list of names. The cron parser numbers weekdays from
/// 1 = Sunday, so numeric tokens cannot be passed through as-is.
fn translate_weekdays(field: &str) -> Result<String, CadenceError> {
    let invalid = || CadenceError::Weekday(field.to_string());
    let mut days = [false; 7];

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            let start = weekday_number(a).ok_or_else(invalid)?;
            let mut end = weekday_number(b).ok_or_else(invalid)?;
            if end == 0 && start > 0 {
                end = 7;
            }
            if end < start {
                return Err(invalid());
            }
            (start, end)
        } else {
            let day = weekday_number(range).ok_or_else(invalid)?;
            match step {
                Some(_) => (day, 6),
                None => (day, day),
            }
        };

        let mut day = start;
        while day <= end {
            days[(day % 7) as usize] = true;
            day += step.unwrap_or(1);
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }

    let names: Vec<&str> = WEEKDAYS
        .iter()
        .zip(days.iter())
        .filter(|(_, on)| **on)
        .map(|(name, _)| *name)
        .collect();
    Ok(names.join(","))
}

/// 0..=7 for numeric tokens (7 kept distinct so `5-7` ranges work), 0..=6
/// for three-letter names.
fn weekday_number(token: &str) -> Option<u32> {
    if let Ok(n) = token.parse::<u32>() {
        return (n <= 7).then_some(n);
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|i| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_sugar_fires_once_a_day() {
        let cadence = Cadence::parse("DAILY@9").unwrap();
        assert_eq!(cadence.scheduler_expression(), "0 0 9 * * *");
        assert_eq!(
            cadence.next_fire(at(2025, 1, 1, 8, 0)),
            Some(at(2025, 1, 1, 9, 0))
        );
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let cadence = Cadence::parse("daily@21:30").unwrap();
        assert_eq!(
            cadence.next_fire(at(2025, 1, 1, 21, 30)),
            Some(at(2025, 1, 2, 21, 30))
        );
    }

    #[test]
    fn daily_sugar_rejects_bad_times() {
        for expr in ["DAILY@24", "DAILY@9:60", "DAILY@9:7", "DAILY@", "DAILY@nine"] {
            assert!(
                matches!(Cadence::parse(expr), Err(CadenceError::DailyTime(_))),
                "{expr} should be rejected"
            );
        }
    }

    #[test]
    fn standard_cron_steps() {
        let cadence = Cadence::parse("*/15 * * * *").unwrap();
        assert_eq!(
            cadence.next_fire(at(2025, 1, 1, 10, 7)),
            Some(at(2025, 1, 1, 10, 15))
        );
    }

    #[test]
    fn weekday_range_skips_weekend() {
        // 2025-01-04 is a Saturday.
        let cadence = Cadence::parse("0 9 * * 1-5").unwrap();
        assert_eq!(
            cadence.next_fire(at(2025, 1, 4, 12, 0)),
            Some(at(2025, 1, 6, 9, 0))
        );
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        let from = at(2025, 1, 1, 0, 0);
        let sunday = Some(at(2025, 1, 5, 0, 0));
        assert_eq!(Cadence::parse("0 0 * * 0").unwrap().next_fire(from), sunday);
        assert_eq!(Cadence::parse("0 0 * * 7").unwrap().next_fire(from), sunday);
        assert_eq!(Cadence::parse("0 0 * * sun").unwrap().next_fire(from), sunday);
    }

    #[test]
    fn range_ending_on_seven_includes_sunday() {
        let cadence = Cadence::parse("0 0 * * 5-7").unwrap();
        assert_eq!(cadence.scheduler_expression(), "0 0 0 * * SUN,FRI,SAT");
        assert_eq!(
            cadence.next_fire(at(2025, 1, 4, 0, 30)),
            Some(at(2025, 1, 5, 0, 0))
        );
    }

    #[test]
    fn day_of_month_and_weekday_are_anded() {
        // First Friday the 13th of 2025 is in June.
        let cadence = Cadence::parse("0 0 13 * 5").unwrap();
        assert_eq!(
            cadence.next_fire(at(2025, 1, 1, 0, 0)),
            Some(at(2025, 6, 13, 0, 0))
        );
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert_eq!(Cadence::parse("").unwrap_err(), CadenceError::Empty);
        assert_eq!(
            Cadence::parse("0 0 9 * * *").unwrap_err(),
            CadenceError::FieldCount(6)
        );
        assert_eq!(
            Cadence::parse("0 9 *").unwrap_err(),
            CadenceError::FieldCount(3)
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            Cadence::parse("61 * * * *"),
            Err(CadenceError::Cron { .. })
        ));
        assert!(matches!(
            Cadence::parse("0 0 * * 8"),
            Err(CadenceError::Weekday(_))
        ));
        assert!(matches!(
            Cadence::parse("0 0 * * 5-2"),
            Err(CadenceError::Weekday(_))
        ));
    }

    #[test]
    fn fires_between_is_half_open() {
        let cadence = Cadence::parse("0 * * * *").unwrap();
        let fires: Vec<_> = cadence
            .fires_between(at(2025, 1, 1, 10, 0), at(2025, 1, 1, 13, 0))
            .collect();
        assert_eq!(
            fires,
            vec![at(2025, 1, 1, 11, 0), at(2025, 1, 1, 12, 0), at(2025, 1, 1, 13, 0)]
        );
    }

    #[test]
    fn convenience_next_fire() {
        let next = next_fire(at(2025, 3, 1, 0, 0), "30 6 * * *").unwrap();
        assert_eq!(next, at(2025, 3, 1, 6, 30));
        assert!(next_fire(at(2025, 3, 1, 0, 0), "bogus").is_err());
    }
}
