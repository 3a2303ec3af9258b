//! Expression Evaluation
//!
//! Expressions evaluate over an ordered tuple of observed values. The
//! semantics are loose JSON: anything can be tested for truthiness, numbers
//! compare across integer/float representations, and arithmetic that does
//! not make sense yields `null` instead of failing.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::{BinaryOp, Builtin, Expr, UnaryOp};

/// Largest integer exactly representable as an f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Evaluate `expr` with `observed[i]` bound to dependency `i`.
pub fn evaluate(expr: &Expr, observed: &[Value]) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Pointer(_) => Value::Null,
        Expr::Dep(index) => observed.get(*index).cloned().unwrap_or(Value::Null),
        Expr::Array(items) => Value::Array(items.iter().map(|e| evaluate(e, observed)).collect()),
        Expr::Unary(UnaryOp::Not, operand) => Value::Bool(!truthy(&evaluate(operand, observed))),
        Expr::Unary(UnaryOp::Neg, operand) => match as_number(&evaluate(operand, observed)) {
            Some(n) => number(-n),
            None => Value::Null,
        },
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let left = evaluate(lhs, observed);
            if truthy(&left) {
                evaluate(rhs, observed)
            } else {
                left
            }
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let left = evaluate(lhs, observed);
            if truthy(&left) {
                left
            } else {
                evaluate(rhs, observed)
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            binary(*op, &evaluate(lhs, observed), &evaluate(rhs, observed))
        }
        Expr::Call(builtin, args) => {
            let args: Vec<Value> = args.iter().map(|e| evaluate(e, observed)).collect();
            call(*builtin, &args)
        }
    }
}

/// Truthiness: `null`, `false`, `0`, `NaN` and `""` are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loose_eq(x, y))
        }
        _ => a == b,
    }
}

/// Convert an f64 result back to JSON, preferring integers when exact.
pub fn number(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(loose_eq(left, right)),
        BinaryOp::Ne => Value::Bool(!loose_eq(left, right)),
        BinaryOp::Lt => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::String(format!("{}{}", text(left), text(right)))
            }
            _ => arithmetic(left, right, |a, b| Some(a + b)),
        },
        BinaryOp::Sub => arithmetic(left, right, |a, b| Some(a - b)),
        BinaryOp::Mul => arithmetic(left, right, |a, b| Some(a * b)),
        BinaryOp::Div => arithmetic(left, right, |a, b| (b != 0.0).then(|| a / b)),
        BinaryOp::Mod => arithmetic(left, right, |a, b| (b != 0.0).then(|| a % b)),
        // Short-circuit operators are handled in `evaluate`.
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

fn arithmetic(left: &Value, right: &Value, f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => f(a, b).map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Numbers an aggregate builtin works on: the elements of a single array
/// argument, or the arguments themselves.
fn numeric_arguments(args: &[Value]) -> Vec<f64> {
    let values: &[Value] = match args {
        [Value::Array(items)] => items,
        _ => args,
    };
    values.iter().filter_map(as_number).collect()
}

fn call(builtin: Builtin, args: &[Value]) -> Value {
    match builtin {
        Builtin::Len => {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                _ => 0,
            };
            Value::from(len)
        }
        Builtin::Sum => number(numeric_arguments(args).iter().sum()),
        Builtin::Min => numeric_arguments(args)
            .into_iter()
            .reduce(f64::min)
            .map(number)
            .unwrap_or(Value::Null),
        Builtin::Max => numeric_arguments(args)
            .into_iter()
            .reduce(f64::max)
            .map(number)
            .unwrap_or(Value::Null),
        Builtin::Includes => match args {
            [Value::Array(items), needle] => {
                Value::Bool(items.iter().any(|item| loose_eq(item, needle)))
            }
            [Value::String(haystack), Value::String(needle)] => {
                Value::Bool(haystack.contains(needle.as_str()))
            }
            _ => Value::Bool(false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::CompiledExpr;
    use serde_json::json;

    fn eval(source: &str, observed: &[Value]) -> Value {
        CompiledExpr::compile(source).unwrap().evaluate(observed)
    }

    #[test]
    fn truthiness_follows_loose_rules() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("0")));
        assert!(truthy(&json!([])));
    }

    #[test]
    fn comparisons_and_equality() {
        assert_eq!(eval("../a == 1", &[json!(1.0)]), json!(true));
        assert_eq!(eval("../a !== 'x'", &[json!("x")]), json!(false));
        assert_eq!(eval("../a < ../b", &[json!("apple"), json!("pear")]), json!(true));
        assert_eq!(eval("../a >= 3", &[json!(null)]), json!(false));
    }

    #[test]
    fn arithmetic_and_concatenation() {
        assert_eq!(eval("../a + 1", &[json!(41)]), json!(42));
        assert_eq!(eval("../a / 2", &[json!(5)]), json!(2.5));
        assert_eq!(eval("../a / 0", &[json!(5)]), json!(null));
        assert_eq!(eval("'#' + ../a", &[json!(7)]), json!("#7"));
        assert_eq!(eval("-../a * 2", &[json!(3)]), json!(-6));
        assert_eq!(eval("../a + 1", &[json!("n")]), json!("n1"));
        assert_eq!(eval("../a - 1", &[json!("n")]), json!(null));
    }

    #[test]
    fn logical_operators_return_operands() {
        assert_eq!(eval("../a || 'fallback'", &[json!("")]), json!("fallback"));
        assert_eq!(eval("../a && ../b", &[json!(1), json!("b")]), json!("b"));
        assert_eq!(eval("!../a", &[json!(0)]), json!(true));
    }

    #[test]
    fn builtins() {
        let prices = json!([1, 2.5, 3]);
        assert_eq!(eval("sum(#/items/*/price)", &[prices.clone()]), json!(6.5));
        assert_eq!(eval("len(#/items/*/price)", &[prices.clone()]), json!(3));
        assert_eq!(eval("max(#/items/*/price)", &[prices.clone()]), json!(3));
        assert_eq!(eval("min(4, 2, 9)", &[]), json!(2));
        assert_eq!(eval("min(#/none)", &[json!([])]), json!(null));
        assert_eq!(eval("includes(['a', 'b'], ./k)", &[json!("b")]), json!(true));
        assert_eq!(eval("includes(./s, 'ell')", &[json!("hello")]), json!(true));
    }
}
