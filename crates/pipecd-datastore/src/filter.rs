//! In-process filter evaluation and ordering over entity JSON
//!
//! Used by FileDB, which has no query engine behind it.

use crate::{Direction, Filter, Operator, Order};
use pipecd_common::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;

/// `ProjectId` -> `projectId`; entity JSON is camelCase
pub fn normalize_field(field: &str) -> String {
    let mut chars = field.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_lowercase().chain(chars).collect()
    })
}

/// Whether `entity` satisfies every filter
pub fn matches(entity: &Value, filters: &[Filter]) -> Result<bool> {
    for f in filters {
        if !matches_one(entity, f)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn matches_one(entity: &Value, f: &Filter) -> Result<bool> {
    if f.field.contains('.') {
        return Err(Error::unsupported(format!("nested field {} is not supported", f.field)));
    }
    let field = normalize_field(&f.field);
    let value = entity.get(&field).unwrap_or(&Value::Null);
    let operand = &f.value;

    match f.operator {
        Operator::Equal => Ok(equal(value, operand)),
        Operator::NotEqual => Ok(!equal(value, operand)),
        Operator::LessThan => Ok(compare(value, operand, &field)? == Ordering::Less),
        Operator::LessThanOrEqual => Ok(compare(value, operand, &field)? != Ordering::Greater),
        Operator::GreaterThan => Ok(compare(value, operand, &field)? == Ordering::Greater),
        Operator::GreaterThanOrEqual => Ok(compare(value, operand, &field)? != Ordering::Less),
        Operator::In => Ok(array_operand(operand, &field)?.iter().any(|v| equal(value, v))),
        Operator::NotIn => Ok(!array_operand(operand, &field)?.iter().any(|v| equal(value, v))),
        Operator::Contains => match value {
            Value::Array(items) => Ok(items.iter().any(|v| equal(v, operand))),
            Value::Null => Ok(false),
            _ => Err(Error::invalid_argument(format!(
                "contains requires {field} to be an array"
            ))),
        },
    }
}

fn array_operand<'a>(operand: &'a Value, field: &str) -> Result<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| Error::invalid_argument(format!("in/not-in filter on {field} requires an array operand")))
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        _ => false,
    }
}

fn compare(a: &Value, b: &Value, field: &str) -> Result<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| Error::invalid_argument(format!("{field} is not comparable")));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(Error::invalid_argument(format!(
            "{field}: cannot compare {a} with {b}"
        ))),
    }
}

/// Total order used for sorting; mismatched types fall back to type rank
fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            let x = as_number(a).unwrap_or_default();
            let y = as_number(b).unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

/// Values of the ordering fields followed by the id
pub fn sort_key(entity: &Value, orders: &[Order]) -> Vec<Value> {
    let mut key: Vec<Value> = orders
        .iter()
        .map(|o| entity.get(normalize_field(&o.field)).cloned().unwrap_or(Value::Null))
        .collect();
    key.push(entity.get("id").cloned().unwrap_or(Value::Null));
    key
}

/// Compare two sort keys; the trailing id is always ascending
pub fn cmp_keys(a: &[Value], b: &[Value], orders: &[Order]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let ord = sort_cmp(x, y);
        let ord = match orders.get(i).map(|o| o.direction) {
            Some(Direction::Desc) => ord.reverse(),
            _ => ord,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
