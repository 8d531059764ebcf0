//! Evaluation of a single person or group property condition.
use std::cmp::Ordering;

use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;

use super::{
    decision::Properties,
    error::InconclusiveMatchError,
    models::{Operator, PropertyFilter},
};

/// Match `filter` against `properties`.
///
/// Returns `Err` rather than `Ok(false)` when the property is absent: "unknown" is not "no
/// match", and the caller must fall back to a source that has the full picture.
///
/// String comparisons are case-sensitive except for `icontains`/`not_icontains`.
pub fn match_property(
    filter: &PropertyFilter,
    properties: &Properties,
) -> Result<bool, InconclusiveMatchError> {
    let key = &filter.key;

    let Some(actual) = properties.get(key) else {
        return Err(InconclusiveMatchError::MissingProperty(key.clone()));
    };

    match filter.operator {
        Operator::IsNotSet => {
            return Err(InconclusiveMatchError::UnsupportedOperator(
                "is_not_set".to_owned(),
            ))
        }
        Operator::FlagEvaluatesTo | Operator::Unknown => {
            return Err(InconclusiveMatchError::UnsupportedOperator(format!(
                "{:?}",
                filter.operator
            )))
        }
        _ => {}
    }

    if actual.is_null() && filter.operator != Operator::IsNot {
        return Ok(false);
    }

    let expected = &filter.value;

    Ok(match filter.operator {
        Operator::Exact => exact_match(expected, actual),
        Operator::IsNot => !exact_match(expected, actual),
        Operator::IsSet => true,

        Operator::Icontains => contains_ignore_case(actual, expected),
        Operator::NotIcontains => !contains_ignore_case(actual, expected),

        Operator::Regex => regex_match(expected, actual).unwrap_or(false),
        Operator::NotRegex => regex_match(expected, actual).is_some_and(|matched| !matched),

        Operator::Gt => compare(actual, expected).is_some_and(Ordering::is_gt),
        Operator::Gte => compare(actual, expected).is_some_and(Ordering::is_ge),
        Operator::Lt => compare(actual, expected).is_some_and(Ordering::is_lt),
        Operator::Lte => compare(actual, expected).is_some_and(Ordering::is_le),

        Operator::IsDateBefore | Operator::IsDateAfter => {
            let target = parse_flag_date(expected).ok_or_else(|| invalid(key, "flag date"))?;
            let actual = parse_property_date(actual).ok_or_else(|| invalid(key, "date"))?;
            if filter.operator == Operator::IsDateBefore {
                actual < target
            } else {
                actual > target
            }
        }

        Operator::SemverEq
        | Operator::SemverNeq
        | Operator::SemverGt
        | Operator::SemverGte
        | Operator::SemverLt
        | Operator::SemverLte => {
            let target = parse_semver(&stringify(expected)).ok_or_else(|| invalid(key, "semver"))?;
            let actual = parse_semver(&stringify(actual)).ok_or_else(|| invalid(key, "semver"))?;
            let ordering = actual.cmp(&target);
            match filter.operator {
                Operator::SemverEq => ordering.is_eq(),
                Operator::SemverNeq => ordering.is_ne(),
                Operator::SemverGt => ordering.is_gt(),
                Operator::SemverGte => ordering.is_ge(),
                Operator::SemverLt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }

        // Handled above.
        Operator::IsNotSet | Operator::FlagEvaluatesTo | Operator::Unknown => false,
    })
}

fn invalid(key: &str, reason: &'static str) -> InconclusiveMatchError {
    InconclusiveMatchError::InvalidValue {
        key: key.to_owned(),
        reason,
    }
}

/// String form of a JSON value as used for comparisons.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn exact_match(expected: &Value, actual: &Value) -> bool {
    let actual = stringify(actual);
    match expected {
        Value::Array(values) => values.iter().any(|v| stringify(v) == actual),
        value => stringify(value) == actual,
    }
}

fn contains_ignore_case(haystack: &Value, needle: &Value) -> bool {
    stringify(haystack)
        .to_lowercase()
        .contains(&stringify(needle).to_lowercase())
}

/// `None` if the pattern is not a valid regular expression.
fn regex_match(pattern: &Value, actual: &Value) -> Option<bool> {
    let regex = Regex::new(&stringify(pattern)).ok()?;
    Some(regex.is_match(&stringify(actual)))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numeric ordering when both sides are numbers (or numeric strings), lexicographic otherwise.
fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (as_number(actual), as_number(expected)) {
        (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs),
        _ => Some(stringify(actual).cmp(&stringify(expected))),
    }
}

fn parse_flag_date(value: &Value) -> Option<DateTime<Utc>> {
    let value = value.as_str()?;
    match parse_relative_date(value, Utc::now()) {
        Some(relative) => relative,
        None => parse_absolute_date(value),
    }
}

fn parse_property_date(value: &Value) -> Option<DateTime<Utc>> {
    parse_absolute_date(value.as_str()?)
}

/// Parse relative dates like `-7d`, `3h`, `2w`, `1m`, `1y` as "that long before `now`".
///
/// Returns `None` if `value` is not a relative date, `Some(None)` if it is one but invalid.
fn parse_relative_date(value: &str, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let unit = digits.chars().last()?;
    let number = &digits[..digits.len() - unit.len_utf8()];
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !matches!(unit, 'h' | 'd' | 'w' | 'm' | 'y') {
        return None;
    }

    let Ok(number) = number.parse::<u32>() else {
        return Some(None);
    };
    if number >= 10_000 {
        return Some(None);
    }

    Some(match unit {
        'h' => now.checked_sub_signed(TimeDelta::hours(number.into())),
        'd' => now.checked_sub_signed(TimeDelta::days(number.into())),
        'w' => now.checked_sub_signed(TimeDelta::weeks(number.into())),
        'm' => now.checked_sub_months(Months::new(number)),
        _ => now.checked_sub_months(Months::new(number * 12)),
    })
}

fn parse_absolute_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a version, accepting a leading `v` and missing minor/patch components.
fn parse_semver(value: &str) -> Option<Version> {
    let value = value.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = Version::parse(value) {
        return Some(version);
    }

    let (core, suffix) = value.split_at(value.find(['-', '+']).unwrap_or(value.len()));
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), suffix)).ok()
}
