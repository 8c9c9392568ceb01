use std::fmt::{Display, Formatter};
use std::str::FromStr;

use time::OffsetDateTime;

use crate::models::{CoreError, CoreErrorKind};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Five-field cron expression: minute, hour, day of month, month, day of week.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FieldSet {
    bits: u64,
}

impl FieldSet {
    fn contains(self, value: u8) -> bool {
        self.bits & (1 << value) != 0
    }
}

struct FieldSpec {
    label: &'static str,
    min: u8,
    max: u8,
    names: &'static [&'static str],
    name_offset: u8,
}

const MINUTE: FieldSpec = FieldSpec {
    label: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_offset: 0,
};
const HOUR: FieldSpec = FieldSpec {
    label: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_offset: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    label: "day of month",
    min: 1,
    max: 31,
    names: &[],
    name_offset: 0,
};
const MONTH: FieldSpec = FieldSpec {
    label: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    name_offset: 1,
};
// 7 is accepted as an alias for Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    label: "day of week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    name_offset: 0,
};

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CoreError> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            return Err(parse_error(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        };

        let mut days_of_week = parse_field(expression, day_of_week, &DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: trimmed.to_string(),
            minutes: parse_field(expression, minute, &MINUTE)?,
            hours: parse_field(expression, hour, &HOUR)?,
            days_of_month: parse_field(expression, day_of_month, &DAY_OF_MONTH)?,
            months: parse_field(expression, month, &MONTH)?,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the schedule fires in the minute containing `at`. Every field
    /// has to match, including both day fields.
    pub fn matches(&self, at: OffsetDateTime) -> bool {
        self.minutes.contains(at.minute())
            && self.hours.contains(at.hour())
            && self.days_of_month.contains(at.day())
            && self.months.contains(u8::from(at.month()))
            && self
                .days_of_week
                .contains(at.weekday().number_days_from_sunday())
    }
}

impl FromStr for CronSchedule {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl Display for CronSchedule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

fn parse_field(expression: &str, raw: &str, bounds: &FieldSpec) -> Result<FieldSet, CoreError> {
    let mut bits = 0_u64;

    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u8>()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| {
                        parse_error(expression, format!("invalid {} step '{step}'", bounds.label))
                    })?;
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (bounds.min, bounds.max)
        } else if let Some((start, end)) = range.split_once('-') {
            (
                parse_value(expression, start, bounds)?,
                parse_value(expression, end, bounds)?,
            )
        } else {
            let start = parse_value(expression, range, bounds)?;
            if item.contains('/') {
                (start, bounds.max)
            } else {
                (start, start)
            }
        };

        if start > end {
            return Err(parse_error(
                expression,
                format!("{} range '{range}' is reversed", bounds.label),
            ));
        }

        let mut value = start;
        while value <= end {
            bits |= 1 << value;
            value = match value.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
    }

    Ok(FieldSet { bits })
}

fn parse_value(expression: &str, raw: &str, bounds: &FieldSpec) -> Result<u8, CoreError> {
    let lowered = raw.to_ascii_lowercase();
    let value = match bounds.names.iter().position(|name| *name == lowered) {
        Some(index) => index as u8 + bounds.name_offset,
        None => raw.parse::<u8>().map_err(|_| {
            parse_error(expression, format!("invalid {} value '{raw}'", bounds.label))
        })?,
    };

    if value < bounds.min || value > bounds.max {
        return Err(parse_error(
            expression,
            format!(
                "{} value {value} is outside {}-{}",
                bounds.label, bounds.min, bounds.max
            ),
        ));
    }
    Ok(value)
}

fn parse_error(expression: &str, detail: String) -> CoreError {
    CoreError::new(
        CoreErrorKind::ParseFailure,
        format!("invalid cron expression '{expression}': {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::CronSchedule;
    use time::macros::datetime;

    #[test]
    fn wildcard_matches_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert!(schedule.matches(datetime!(2024-02-29 13:37 UTC)));
    }

    #[test]
    fn steps_ranges_and_lists() {
        let schedule = CronSchedule::parse("*/15 9-17 * * mon-fri").unwrap();
        assert!(schedule.matches(datetime!(2024-03-04 09:45 UTC)));
        assert!(!schedule.matches(datetime!(2024-03-04 09:50 UTC)));
        assert!(!schedule.matches(datetime!(2024-03-04 18:00 UTC)));
        // 2024-03-09 is a Saturday.
        assert!(!schedule.matches(datetime!(2024-03-09 10:00 UTC)));

        let schedule = CronSchedule::parse("5,35 0 * jan,jul *").unwrap();
        assert!(schedule.matches(datetime!(2024-07-01 00:35 UTC)));
        assert!(!schedule.matches(datetime!(2024-08-01 00:35 UTC)));
    }

    #[test]
    fn sunday_can_be_written_as_seven() {
        let schedule = CronSchedule::parse("0 3 * * 7").unwrap();
        // 2024-03-10 is a Sunday.
        assert!(schedule.matches(datetime!(2024-03-10 03:00 UTC)));
        assert!(!schedule.matches(datetime!(2024-03-11 03:00 UTC)));
    }

    #[test]
    fn both_day_fields_must_match() {
        let schedule = CronSchedule::parse("0 0 1 * sun").unwrap();
        // A Friday that is the first of the month, and a Sunday that is not.
        assert!(!schedule.matches(datetime!(2024-03-01 00:00 UTC)));
        assert!(!schedule.matches(datetime!(2024-03-10 00:00 UTC)));
        // 2024-09-01 is both.
        assert!(schedule.matches(datetime!(2024-09-01 00:00 UTC)));
    }

    #[test]
    fn macros_expand() {
        let schedule = CronSchedule::parse("@daily").unwrap();
        assert!(schedule.matches(datetime!(2024-05-05 00:00 UTC)));
        assert!(!schedule.matches(datetime!(2024-05-05 00:01 UTC)));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expression in ["", "* * * *", "61 * * * *", "*/0 * * * *", "5-1 * * * *", "0 0 * foo *"] {
            assert!(CronSchedule::parse(expression).is_err(), "{expression}");
        }
    }
}
