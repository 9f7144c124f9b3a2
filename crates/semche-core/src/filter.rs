//! Metadata filters for search, delete, and listing.
//!
//! Filters are written as JSON objects:
//!
//! ```json
//! { "language": "python" }
//! { "stars": { "$gte": 10, "$lt": 100 } }
//! { "language": { "$in": ["rust", "go"] }, "projectName": "semche" }
//! { "$or": [ { "language": "rust" }, { "draft": true } ] }
//! ```
//!
//! Several keys in one object are combined with AND. A missing field only
//! satisfies `$ne` and `$nin`.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::models::{Metadata, MetadataValue};

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Eq(MetadataValue),
    Ne(MetadataValue),
    Gt(MetadataValue),
    Gte(MetadataValue),
    Lt(MetadataValue),
    Lte(MetadataValue),
    In(Vec<MetadataValue>),
    NotIn(Vec<MetadataValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
    Field { key: String, op: Comparison },
}

impl Default for MetadataFilter {
    fn default() -> Self {
        MetadataFilter::And(Vec::new())
    }
}

impl MetadataFilter {
    /// Equality shorthand.
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        MetadataFilter::Field {
            key: key.into(),
            op: Comparison::Eq(value.into()),
        }
    }

    pub fn field(key: impl Into<String>, op: Comparison) -> Self {
        MetadataFilter::Field {
            key: key.into(),
            op,
        }
    }

    /// True when the filter places no constraint.
    pub fn is_empty(&self) -> bool {
        match self {
            MetadataFilter::And(parts) => parts.iter().all(|p| p.is_empty()),
            _ => false,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            Error::Validation(format!("filter must be an object, got {value}"))
        })?;

        let mut parts = Vec::with_capacity(obj.len());
        for (key, raw) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let items = raw.as_array().ok_or_else(|| {
                        Error::Validation(format!("{key} expects an array of filters"))
                    })?;
                    let nested = items
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>>>()?;
                    parts.push(if key == "$and" {
                        MetadataFilter::And(nested)
                    } else {
                        MetadataFilter::Or(nested)
                    });
                }
                _ if key.starts_with('$') => {
                    return Err(Error::Validation(format!("unknown filter operator '{key}'")));
                }
                _ => parse_field(key, raw, &mut parts)?,
            }
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(MetadataFilter::And(parts))
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            MetadataFilter::And(parts) => parts.iter().all(|p| p.matches(metadata)),
            MetadataFilter::Or(parts) => parts.iter().any(|p| p.matches(metadata)),
            MetadataFilter::Field { key, op } => {
                let value = metadata.get(key);
                match (value.as_deref(), op) {
                    (None, Comparison::Ne(_) | Comparison::NotIn(_)) => true,
                    (None, _) => false,
                    (Some(v), Comparison::Eq(target)) => values_equal(v, target),
                    (Some(v), Comparison::Ne(target)) => !values_equal(v, target),
                    (Some(v), Comparison::Gt(target)) => {
                        compare(v, target) == Some(Ordering::Greater)
                    }
                    (Some(v), Comparison::Gte(target)) => matches!(
                        compare(v, target),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    (Some(v), Comparison::Lt(target)) => compare(v, target) == Some(Ordering::Less),
                    (Some(v), Comparison::Lte(target)) => {
                        matches!(compare(v, target), Some(Ordering::Less | Ordering::Equal))
                    }
                    (Some(v), Comparison::In(set)) => set.iter().any(|t| values_equal(v, t)),
                    (Some(v), Comparison::NotIn(set)) => !set.iter().any(|t| values_equal(v, t)),
                }
            }
        }
    }
}

fn parse_field(key: &str, raw: &serde_json::Value, parts: &mut Vec<MetadataFilter>) -> Result<()> {
    let Some(ops) = raw.as_object() else {
        let value = scalar(key, raw)?;
        parts.push(MetadataFilter::field(key, Comparison::Eq(value)));
        return Ok(());
    };

    if ops.is_empty() {
        return Err(Error::Validation(format!(
            "filter for '{key}' has no operators"
        )));
    }

    for (op, operand) in ops {
        let comparison = match op.as_str() {
            "$eq" => Comparison::Eq(scalar(key, operand)?),
            "$ne" => Comparison::Ne(scalar(key, operand)?),
            "$gt" => Comparison::Gt(scalar(key, operand)?),
            "$gte" => Comparison::Gte(scalar(key, operand)?),
            "$lt" => Comparison::Lt(scalar(key, operand)?),
            "$lte" => Comparison::Lte(scalar(key, operand)?),
            "$in" | "$nin" => {
                let items = operand.as_array().ok_or_else(|| {
                    Error::Validation(format!("{op} on '{key}' expects an array"))
                })?;
                let values = items
                    .iter()
                    .map(|v| scalar(key, v))
                    .collect::<Result<Vec<_>>>()?;
                if op == "$in" {
                    Comparison::In(values)
                } else {
                    Comparison::NotIn(values)
                }
            }
            other => {
                return Err(Error::Validation(format!(
                    "unknown filter operator '{other}' on '{key}'"
                )))
            }
        };
        parts.push(MetadataFilter::field(key, comparison));
    }
    Ok(())
}

fn scalar(key: &str, value: &serde_json::Value) -> Result<MetadataValue> {
    MetadataValue::from_json(value).ok_or_else(|| {
        Error::Validation(format!(
            "filter value for '{key}' must be a string, number, or bool"
        ))
    })
}

fn values_equal(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Order two values of comparable type: numbers numerically, strings
/// lexicographically. Anything else is unordered.
fn compare(a: &MetadataValue, b: &MetadataValue) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (MetadataValue::String(x), MetadataValue::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
