//! Clause operators comparing a context value against a clause value.
use chrono::DateTime;
use regex::Regex;
use semver::{BuildMetadata, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Clause operators.
///
/// Operator names not known to this crate deserialize to [`Operator::Unknown`], which never
/// matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum Operator {
    /// Equal to one of the values. Strings, numbers, and booleans only.
    In,
    EndsWith,
    StartsWith,
    /// Attribute matches the regular expression given as clause value.
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// Attribute is a timestamp (milliseconds since epoch or RFC 3339 string) before the clause
    /// value.
    Before,
    /// Same as [`Operator::Before`] but strictly after.
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    /// Context is a member of one of the listed segments. Resolved by the evaluator, not by
    /// [`Operator::apply`].
    SegmentMatch,
    Unknown,
}

impl Operator {
    pub fn from_name(name: &str) -> Operator {
        match name {
            "in" => Operator::In,
            "endsWith" => Operator::EndsWith,
            "startsWith" => Operator::StartsWith,
            "matches" => Operator::Matches,
            "contains" => Operator::Contains,
            "lessThan" => Operator::LessThan,
            "lessThanOrEqual" => Operator::LessThanOrEqual,
            "greaterThan" => Operator::GreaterThan,
            "greaterThanOrEqual" => Operator::GreaterThanOrEqual,
            "before" => Operator::Before,
            "after" => Operator::After,
            "semVerEqual" => Operator::SemVerEqual,
            "semVerLessThan" => Operator::SemVerLessThan,
            "semVerGreaterThan" => Operator::SemVerGreaterThan,
            "segmentMatch" => Operator::SegmentMatch,
            _ => Operator::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::In => "in",
            Operator::EndsWith => "endsWith",
            Operator::StartsWith => "startsWith",
            Operator::Matches => "matches",
            Operator::Contains => "contains",
            Operator::LessThan => "lessThan",
            Operator::LessThanOrEqual => "lessThanOrEqual",
            Operator::GreaterThan => "greaterThan",
            Operator::GreaterThanOrEqual => "greaterThanOrEqual",
            Operator::Before => "before",
            Operator::After => "after",
            Operator::SemVerEqual => "semVerEqual",
            Operator::SemVerLessThan => "semVerLessThan",
            Operator::SemVerGreaterThan => "semVerGreaterThan",
            Operator::SegmentMatch => "segmentMatch",
            Operator::Unknown => "unknown",
        }
    }

    /// Apply the operator to a context value `a` and a clause value `b`. Returns `false` if the
    /// operands have the wrong types or cannot be parsed.
    pub fn apply(self, a: &Value, b: &Value) -> bool {
        self.try_apply(a, b).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` if it cannot be applied to these operands.
    fn try_apply(self, a: &Value, b: &Value) -> Option<bool> {
        match self {
            Operator::In => Some(scalar_eq(a, b)),

            Operator::EndsWith | Operator::StartsWith | Operator::Contains => {
                let (a, b) = (a.as_str()?, b.as_str()?);
                Some(match self {
                    Operator::EndsWith => a.ends_with(b),
                    Operator::StartsWith => a.starts_with(b),
                    _ => a.contains(b),
                })
            }

            Operator::Matches => {
                let s = a.as_str()?;
                let regex = Regex::new(b.as_str()?).ok()?;
                Some(regex.is_match(s))
            }

            Operator::LessThan
            | Operator::LessThanOrEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual => {
                let (a, b) = (a.as_f64()?, b.as_f64()?);
                Some(match self {
                    Operator::LessThan => a < b,
                    Operator::LessThanOrEqual => a <= b,
                    Operator::GreaterThan => a > b,
                    _ => a >= b,
                })
            }

            Operator::Before | Operator::After => {
                let (a, b) = (parse_time(a)?, parse_time(b)?);
                Some(if self == Operator::Before { a < b } else { a > b })
            }

            Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
                let a = parse_semver(a.as_str()?)?;
                let b = parse_semver(b.as_str()?)?;
                Some(match self {
                    Operator::SemVerEqual => a == b,
                    Operator::SemVerLessThan => a < b,
                    _ => a > b,
                })
            }

            Operator::SegmentMatch | Operator::Unknown => None,
        }
    }
}

impl From<String> for Operator {
    fn from(value: String) -> Operator {
        Operator::from_name(&value)
    }
}

impl From<Operator> for &'static str {
    fn from(value: Operator) -> &'static str {
        value.name()
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

/// Milliseconds since epoch from a number or an RFC 3339 string.
fn parse_time(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis() as f64),
        _ => None,
    }
}

/// Parse a semantic version, padding `MAJOR` or `MAJOR.MINOR` with zero components. Build
/// metadata is dropped as it does not take part in precedence.
fn parse_semver(s: &str) -> Option<Version> {
    let mut version = match Version::parse(s) {
        Ok(version) => version,
        Err(_) => {
            let numeric_end = s
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(s.len());
            let (numbers, rest) = s.split_at(numeric_end);
            let parts = numbers.split('.').collect::<Vec<_>>();
            if parts.len() > 3 || parts.iter().any(|part| part.is_empty()) {
                return None;
            }
            let mut padded = parts.join(".");
            for _ in parts.len()..3 {
                padded.push_str(".0");
            }
            padded.push_str(rest);
            Version::parse(&padded).ok()?
        }
    };
    version.build = BuildMetadata::EMPTY;
    Some(version)
}
