use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{CoreError, Result};

/// A validated scheduling instant.
///
/// Constructible from a `DateTime<Utc>` directly, or parsed from the
/// expression grammar
///
/// ```text
/// <timestamp-or-'now'> [ | add <±N><unit> ]
/// ```
///
/// where the unit is one of seconds, minutes, hours, days, months or years
/// (short forms accepted, e.g. `-1h`, `+30min`, `3 months`). The expression
/// is resolved exactly once, at schedule time, against the injected
/// [`Clock`] — never against wall-clock time directly — so scheduling is
/// deterministic under test.
///
/// At most one `|`-separated operation is allowed; combining operations is a
/// not-yet-supported feature and fails with a descriptive error rather than
/// being silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduledAt(DateTime<Utc>);

impl ScheduledAt {
    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    /// Resolve `now` against the clock, with no offset.
    pub fn now(clock: &dyn Clock) -> Self {
        Self(clock.now())
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    /// Parse and resolve a schedule expression.
    pub fn parse(expr: &str, clock: &dyn Clock) -> Result<Self> {
        let parts: Vec<&str> = expr.split('|').map(str::trim).collect();
        if parts.len() > 2 {
            return Err(CoreError::TooManyOperations {
                count: parts.len() - 1,
            });
        }

        let base = parse_base(parts[0], clock)?;
        let resolved = match parts.get(1) {
            None => base,
            Some(op) => apply_operation(base, op)?,
        };
        Ok(Self(resolved))
    }
}

impl From<DateTime<Utc>> for ScheduledAt {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }
}

impl std::fmt::Display for ScheduledAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Parse the leading `<timestamp-or-'now'>` segment.
fn parse_base(input: &str, clock: &dyn Clock) -> Result<DateTime<Utc>> {
    if input.eq_ignore_ascii_case("now") {
        return Ok(clock.now());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Bare dates resolve to midnight UTC.
    if let Ok(date) = input.parse::<NaiveDate>() {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(CoreError::InvalidTimestamp(input.to_string()))
}

/// Apply a single `add <±N><unit>` operation.
fn apply_operation(base: DateTime<Utc>, op: &str) -> Result<DateTime<Utc>> {
    let (operator, operand) = match op.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (op, ""),
    };
    if operator != "add" {
        return Err(CoreError::UnknownOperator(operator.to_string()));
    }
    if operand.is_empty() {
        return Err(CoreError::InvalidAmount(op.to_string()));
    }

    let (amount, unit) = split_amount(operand)?;
    let out_of_range = || CoreError::OffsetOutOfRange(op.to_string());

    match unit_kind(unit)? {
        UnitKind::Seconds => base
            .checked_add_signed(Duration::seconds(amount))
            .ok_or_else(out_of_range),
        UnitKind::Minutes => base
            .checked_add_signed(Duration::minutes(amount))
            .ok_or_else(out_of_range),
        UnitKind::Hours => base
            .checked_add_signed(Duration::hours(amount))
            .ok_or_else(out_of_range),
        UnitKind::Days => base
            .checked_add_signed(Duration::days(amount))
            .ok_or_else(out_of_range),
        UnitKind::Months => add_months(base, amount).ok_or_else(out_of_range),
        UnitKind::Years => add_months(base, amount.checked_mul(12).ok_or_else(out_of_range)?)
            .ok_or_else(out_of_range),
    }
}

/// Calendar-aware month shift (clamps to the last day of shorter months).
fn add_months(base: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
    if months >= 0 {
        base.checked_add_months(Months::new(magnitude))
    } else {
        base.checked_sub_months(Months::new(magnitude))
    }
}

/// Split `"-1h"` / `"+30 min"` / `"3 months"` into signed amount and unit.
fn split_amount(operand: &str) -> Result<(i64, &str)> {
    let digits_end = operand
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '+' || *c == '-')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);

    let (num, unit) = operand.split_at(digits_end);
    let amount: i64 = num
        .parse()
        .map_err(|_| CoreError::InvalidAmount(operand.to_string()))?;
    Ok((amount, unit.trim()))
}

enum UnitKind {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
    Years,
}

fn unit_kind(unit: &str) -> Result<UnitKind> {
    // `m`/`min` mean minutes; months must be spelled `mo`/`month(s)`.
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(UnitKind::Seconds),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(UnitKind::Minutes),
        "h" | "hr" | "hrs" | "hour" | "hours" => Ok(UnitKind::Hours),
        "d" | "day" | "days" => Ok(UnitKind::Days),
        "mo" | "month" | "months" => Ok(UnitKind::Months),
        "y" | "yr" | "yrs" | "year" | "years" => Ok(UnitKind::Years),
        other => Err(CoreError::UnknownUnit(other.to_string())),
    }
}
