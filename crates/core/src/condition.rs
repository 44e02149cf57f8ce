//! Restricted condition evaluator used by routing steps, evaluator stopping
//! criteria and recovery rule matchers.
//!
//! Conditions are data, never source text: a field path, one operator from a
//! closed set and a JSON operand, combined with `all` / `any` / `not`.
//!
//! ```json
//! { "all": [
//!     { "field": "ticket.priority", "op": "in", "value": ["p0", "p1"] },
//!     { "not": { "field": "ticket.title", "op": "matches", "value": "(?i)^test" } }
//! ] }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Contains,
    Matches,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Not { not: Box<Condition> },
    Field(FieldCondition),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("condition field path must not be empty")]
    EmptyField,
    #[error("invalid regular expression `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("operator `{op:?}` requires {expected} operand")]
    InvalidOperand { op: Operator, expected: &'static str },
}

impl Condition {
    pub fn field(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Self::Field(FieldCondition { field: field.into(), op, value })
    }

    /// Checks operands up front so evaluation failures surface at submission.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Self::All { all } => all.iter().try_for_each(Self::validate),
            Self::Any { any } => any.iter().try_for_each(Self::validate),
            Self::Not { not } => not.validate(),
            Self::Field(field) => field.validate(),
        }
    }

    pub fn evaluate(&self, subject: &Value) -> Result<bool, ConditionError> {
        match self {
            Self::All { all } => {
                for condition in all {
                    if !condition.evaluate(subject)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any { any } => {
                for condition in any {
                    if condition.evaluate(subject)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { not } => Ok(!not.evaluate(subject)?),
            Self::Field(field) => field.evaluate(subject),
        }
    }
}

impl FieldCondition {
    fn validate(&self) -> Result<(), ConditionError> {
        if self.field.trim().is_empty() {
            return Err(ConditionError::EmptyField);
        }
        match self.op {
            Operator::Matches => compile(&self.value).map(|_| ()),
            Operator::In if !self.value.is_array() => {
                Err(ConditionError::InvalidOperand { op: self.op, expected: "an array" })
            }
            Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte
                if as_f64(&self.value).is_none() && !self.value.is_string() =>
            {
                Err(ConditionError::InvalidOperand {
                    op: self.op,
                    expected: "a numeric or string",
                })
            }
            _ => Ok(()),
        }
    }

    fn evaluate(&self, subject: &Value) -> Result<bool, ConditionError> {
        let actual = resolve_path(subject, &self.field);
        let expected = &self.value;

        let outcome = match self.op {
            Operator::Eq => actual.is_some_and(|actual| loose_eq(actual, expected)),
            Operator::Ne => !actual.is_some_and(|actual| loose_eq(actual, expected)),
            Operator::Gt => compare(actual, expected).is_some_and(|ord| ord.is_gt()),
            Operator::Lt => compare(actual, expected).is_some_and(|ord| ord.is_lt()),
            Operator::Gte => compare(actual, expected).is_some_and(|ord| ord.is_ge()),
            Operator::Lte => compare(actual, expected).is_some_and(|ord| ord.is_le()),
            Operator::In => match (actual, expected) {
                (Some(actual), Value::Array(options)) => {
                    options.iter().any(|option| loose_eq(actual, option))
                }
                _ => false,
            },
            Operator::Contains => actual.is_some_and(|actual| contains(actual, expected)),
            Operator::Matches => {
                let regex = compile(expected)?;
                actual.and_then(display_string).is_some_and(|text| regex.is_match(&text))
            }
        };

        Ok(outcome)
    }
}

/// Resolves a dot-separated path (`a.b.0.c`); numeric segments index arrays.
pub fn resolve_path<'a>(subject: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Some(subject);
    }

    path.trim_start_matches("$.").split('.').try_fold(subject, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn compile(pattern: &Value) -> Result<Regex, ConditionError> {
    let Value::String(pattern) = pattern else {
        return Err(ConditionError::InvalidOperand {
            op: Operator::Matches,
            expected: "a string pattern",
        });
    };
    Regex::new(pattern).map_err(|error| ConditionError::InvalidPattern {
        pattern: pattern.clone(),
        reason: error.to_string(),
    })
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn display_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }

    match (actual, expected) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_f64(actual), as_f64(expected)), (Some(a), Some(b)) if a == b)
        }
        (Value::Bool(flag), Value::String(text)) | (Value::String(text), Value::Bool(flag)) => {
            text.eq_ignore_ascii_case(if *flag { "true" } else { "false" })
        }
        _ => false,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(a), Some(b)) = (as_f64(actual), as_f64(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(text) => match expected {
            Value::String(needle) => text.contains(needle.as_str()),
            other => display_string(other).is_some_and(|needle| text.contains(&needle)),
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}
