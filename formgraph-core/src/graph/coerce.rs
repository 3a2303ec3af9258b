//! Leaf Value Coercion
//!
//! Typed leaves normalize whatever they are given. Input that cannot be
//! read as the leaf's type becomes undefined, never an error; the validator
//! reports missing required values afterwards.

use serde_json::Value;

use crate::expr::{number_value, truthy};
use crate::schema::SchemaKind;

/// Coerce `value` for a leaf of `kind`. `None` is undefined.
pub fn coerce(kind: SchemaKind, value: Option<Value>) -> Option<Value> {
    let value = value?;
    match kind {
        SchemaKind::String => match value {
            Value::String(_) => Some(value),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        SchemaKind::Number => parse_number(&value).map(|n| match value {
            Value::Number(_) => value,
            _ => number_value(n),
        }),
        SchemaKind::Integer => parse_number(&value).map(|n| number_value(n.round())),
        SchemaKind::Boolean => match value {
            Value::Bool(_) => Some(value),
            Value::String(s) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(_) => Some(Value::Bool(truthy(&value))),
            _ => None,
        },
        SchemaKind::Null => Some(Value::Null),
        // Composite and virtual nodes never hold raw leaf input.
        SchemaKind::Object | SchemaKind::Array | SchemaKind::Virtual => Some(value),
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(kind: SchemaKind, value: Value) -> Option<Value> {
        coerce(kind, Some(value))
    }

    #[test]
    fn null_and_undefined_become_undefined() {
        assert_eq!(coerce(SchemaKind::String, None), None);
        assert_eq!(run(SchemaKind::String, json!(null)), None);
        assert_eq!(run(SchemaKind::Number, json!(null)), None);
        assert_eq!(run(SchemaKind::Boolean, json!(null)), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(run(SchemaKind::Number, json!(1.5)), Some(json!(1.5)));
        assert_eq!(run(SchemaKind::Number, json!(" 42 ")), Some(json!(42)));
        assert_eq!(run(SchemaKind::Number, json!("4.25")), Some(json!(4.25)));
        assert_eq!(run(SchemaKind::Number, json!("abc")), None);
        assert_eq!(run(SchemaKind::Number, json!("")), None);
        assert_eq!(run(SchemaKind::Number, json!(true)), None);
        assert_eq!(run(SchemaKind::Integer, json!(2.6)), Some(json!(3)));
        assert_eq!(run(SchemaKind::Integer, json!("7.2")), Some(json!(7)));
    }

    #[test]
    fn booleans_and_strings() {
        assert_eq!(run(SchemaKind::Boolean, json!("true")), Some(json!(true)));
        assert_eq!(run(SchemaKind::Boolean, json!("nope")), None);
        assert_eq!(run(SchemaKind::Boolean, json!(0)), Some(json!(false)));
        assert_eq!(run(SchemaKind::String, json!(12)), Some(json!("12")));
        assert_eq!(run(SchemaKind::String, json!(false)), Some(json!("false")));
        assert_eq!(run(SchemaKind::String, json!({ "a": 1 })), None);
    }
}
