//! Dynamic record values and the filter-matching predicate.
//!
//! Records have no fixed schema: a row is an unordered map from field name to
//! a JSON-shaped value. Ordering comparisons are defined only within the
//! numeric and string branches; everything else is "not equal and unordered".

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SudbError;

/// A single record: field name → dynamically-typed value.
pub type Row = Map<String, Value>;

/// A parsed filter object: field name → scalar (equality) or
/// `{"operator": op, "value": v}`.
pub type Filter = Map<String, Value>;

/// Database storage shape. Only `json` and `table` are load-bearing; `text`
/// and `graph` get directory scaffolding only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Json,
    Text,
    Table,
    Graph,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Text => write!(f, "text"),
            Self::Table => write!(f, "table"),
            Self::Graph => write!(f, "graph"),
        }
    }
}

impl FromStr for StorageType {
    type Err = SudbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "graph" => Ok(Self::Graph),
            other => Err(SudbError::Parse(format!("不支持的存储类型: {other}"))),
        }
    }
}

/// Comparison operator in a filter conjunct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    Ne,
}

impl FromStr for CompareOp {
    type Err = SudbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Self::Eq),
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            ">=" => Ok(Self::Ge),
            "<=" => Ok(Self::Le),
            "!=" => Ok(Self::Ne),
            other => Err(SudbError::Parse(format!("无效的比较运算符: {other}"))),
        }
    }
}

/// A single column comparison (the table path's `WHERE` shape).
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

/// Order two values. `Some(_)` only when both sides are numbers or both are
/// strings; heterogeneous pairs are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN).partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Value equality with numbers compared as doubles, so `25` and `25.0`
/// are the same value regardless of how serde_json tagged them.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        _ => a == b,
    }
}

/// Evaluate one comparison against a row. A missing field never matches.
pub fn matches_condition(row: &Row, column: &str, op: CompareOp, value: &Value) -> bool {
    let Some(actual) = row.get(column) else {
        return false;
    };
    match op {
        CompareOp::Eq => values_equal(actual, value),
        CompareOp::Ne => !values_equal(actual, value),
        CompareOp::Gt => matches!(compare_values(actual, value), Some(Ordering::Greater)),
        CompareOp::Lt => matches!(compare_values(actual, value), Some(Ordering::Less)),
        CompareOp::Ge => matches!(
            compare_values(actual, value),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        CompareOp::Le => matches!(
            compare_values(actual, value),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
    }
}

/// The single matching predicate shared by the SELECT and UPDATE paths.
///
/// Each filter field is either a scalar (equality) or an object
/// `{"operator": op, "value": v}`; multi-field filters AND their conjuncts.
/// A `None` filter matches everything.
pub fn matches_filter(row: &Row, filter: Option<&Filter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    for (column, conjunct) in filter {
        let (op, value) = match conjunct {
            Value::Object(cond) => {
                let op = cond
                    .get("operator")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(CompareOp::Eq);
                (op, cond.get("value").unwrap_or(&Value::Null))
            }
            scalar => (CompareOp::Eq, scalar),
        };
        if !matches_condition(row, column, op, value) {
            return false;
        }
    }
    true
}

/// Project a row onto the named columns; missing fields are omitted.
pub fn project_row(row: &Row, columns: &[String]) -> Row {
    let mut out = Row::new();
    for col in columns {
        if let Some(v) = row.get(col) {
            out.insert(col.clone(), v.clone());
        }
    }
    out
}
