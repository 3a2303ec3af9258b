//! `allOf` Merging
//!
//! Collapses a schema and its `allOf` branches into one constraint set.
//! Keywords are merged by class:
//!
//! | class | keywords | rule |
//! |-------|----------|------|
//! | lower bounds | `minimum`, `minLength`, ... | largest wins |
//! | upper bounds | `maximum`, `maxLength`, ... | smallest wins |
//! | `pattern` | | both must match (lookahead conjunction) |
//! | `enum` | | intersection, must stay non-empty |
//! | `const` | | must be equal |
//! | `required` | | union |
//! | first-win | `title`, `description`, `default`, ... | base keeps its value |
//! | `properties` / `items` | | recursive merge |
//! | `type` | | must not change |
//! | anything else | | branch overwrites |
//!
//! After every merge, paired bounds are checked so that no lower bound
//! exceeds its upper bound.

use serde_json::{Map, Value};

use crate::error::{preview, SchemaError};
use crate::expr::escape_segment;

/// A JSON Schema object.
pub type SchemaMap = Map<String, Value>;

/// Annotations where the base schema keeps its own value.
pub const FIRST_WIN_KEYWORDS: &[&str] = &[
    "title",
    "description",
    "default",
    "readOnly",
    "writeOnly",
    "$comment",
    "examples",
];

const LOWER_BOUNDS: &[&str] = &[
    "minimum",
    "exclusiveMinimum",
    "minLength",
    "minItems",
    "minProperties",
    "minContains",
];

const UPPER_BOUNDS: &[&str] = &[
    "maximum",
    "exclusiveMaximum",
    "maxLength",
    "maxItems",
    "maxProperties",
    "maxContains",
];

/// `(lower, upper, strict)`: with `strict`, equal bounds also conflict.
const BOUND_PAIRS: &[(&str, &str, bool)] = &[
    ("minimum", "maximum", false),
    ("exclusiveMinimum", "maximum", true),
    ("minimum", "exclusiveMaximum", true),
    ("exclusiveMinimum", "exclusiveMaximum", true),
    ("minLength", "maxLength", false),
    ("minItems", "maxItems", false),
    ("minProperties", "maxProperties", false),
    ("minContains", "maxContains", false),
];

/// Copy of `schema` without the listed keywords, order preserved.
pub(crate) fn without(schema: &SchemaMap, keys: &[&str]) -> SchemaMap {
    schema
        .iter()
        .filter(|(key, _)| !keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Merge `schema` with each of its `allOf` branches, in order.
pub fn collapse_all_of(schema: &SchemaMap, path: &str) -> Result<SchemaMap, SchemaError> {
    let Some(all_of) = schema.get("allOf") else {
        return Ok(schema.clone());
    };
    let branches = all_of.as_array().ok_or_else(|| SchemaError::InvalidSchema {
        path: format!("{path}/allOf"),
        reason: format!("allOf must be an array, got {}", preview(all_of)),
    })?;

    let mut merged = without(schema, &["allOf"]);
    for (index, branch) in branches.iter().enumerate() {
        let branch_path = format!("{path}/allOf/{index}");
        let branch = branch.as_object().ok_or_else(|| SchemaError::InvalidSchema {
            path: branch_path.clone(),
            reason: format!("allOf branch must be an object, got {}", preview(branch)),
        })?;
        merged = merge_schemas(&merged, branch, &branch_path)?;
    }
    Ok(merged)
}

/// Merge `branch` into `base`.
///
/// `base` wins first-win annotations; every other rule is described in the
/// module docs. `branch` may itself carry `allOf`, which is collapsed first.
pub fn merge_schemas(
    base: &SchemaMap,
    branch: &SchemaMap,
    path: &str,
) -> Result<SchemaMap, SchemaError> {
    let branch = collapse_all_of(branch, path)?;
    let mut merged = base.clone();

    for (keyword, incoming) in &branch {
        let Some(existing) = base.get(keyword) else {
            merged.insert(keyword.clone(), incoming.clone());
            continue;
        };

        let value = match keyword.as_str() {
            "type" => {
                if existing != incoming {
                    return Err(SchemaError::TypeRedefinition {
                        path: path.to_string(),
                        base: preview(existing),
                        branch: preview(incoming),
                    });
                }
                existing.clone()
            }
            k if LOWER_BOUNDS.contains(&k) => tighter(existing, incoming, true),
            k if UPPER_BOUNDS.contains(&k) => tighter(existing, incoming, false),
            "pattern" => merge_patterns(existing, incoming),
            "enum" => intersect_enums(existing, incoming, path)?,
            "const" => {
                if existing != incoming {
                    return Err(SchemaError::ConflictingConst {
                        path: path.to_string(),
                        left: preview(existing),
                        right: preview(incoming),
                    });
                }
                existing.clone()
            }
            "required" => union_required(existing, incoming),
            "properties" => merge_properties(existing, incoming, path)?,
            "items" => merge_items(existing, incoming, path)?,
            k if FIRST_WIN_KEYWORDS.contains(&k) => existing.clone(),
            _ => incoming.clone(),
        };
        merged.insert(keyword.clone(), value);
    }

    check_bounds(&merged, path)?;
    Ok(merged)
}

/// Pick the more restrictive of two bounds.
fn tighter(existing: &Value, incoming: &Value, lower: bool) -> Value {
    match (existing.as_f64(), incoming.as_f64()) {
        (Some(a), Some(b)) => {
            let take_incoming = if lower { b > a } else { b < a };
            if take_incoming {
                incoming.clone()
            } else {
                existing.clone()
            }
        }
        _ => incoming.clone(),
    }
}

/// Both patterns must match somewhere in the instance. JSON Schema patterns
/// are unanchored searches, so each side gets its own anchored lookahead.
fn merge_patterns(existing: &Value, incoming: &Value) -> Value {
    match (existing.as_str(), incoming.as_str()) {
        (Some(a), Some(b)) if a == b => existing.clone(),
        (Some(a), Some(b)) => {
            Value::String(format!(r"^(?=[\s\S]*?(?:{a}))(?=[\s\S]*?(?:{b}))"))
        }
        _ => incoming.clone(),
    }
}

fn intersect_enums(existing: &Value, incoming: &Value, path: &str) -> Result<Value, SchemaError> {
    let (Some(left), Some(right)) = (existing.as_array(), incoming.as_array()) else {
        return Err(SchemaError::InvalidSchema {
            path: path.to_string(),
            reason: "enum must be an array".to_string(),
        });
    };
    let common: Vec<Value> = left.iter().filter(|v| right.contains(v)).cloned().collect();
    if common.is_empty() {
        return Err(SchemaError::EmptyEnumIntersection {
            path: path.to_string(),
            left: preview(existing),
            right: preview(incoming),
        });
    }
    Ok(Value::Array(common))
}

fn union_required(existing: &Value, incoming: &Value) -> Value {
    let mut names: Vec<Value> = existing.as_array().cloned().unwrap_or_default();
    for name in incoming.as_array().into_iter().flatten() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    Value::Array(names)
}

/// Same-named properties merge recursively; new ones are appended as-is.
fn merge_properties(existing: &Value, incoming: &Value, path: &str) -> Result<Value, SchemaError> {
    let (Some(left), Some(right)) = (existing.as_object(), incoming.as_object()) else {
        return Ok(incoming.clone());
    };
    let mut merged = left.clone();
    for (name, schema) in right {
        let property_path = format!("{path}/properties/{}", escape_segment(name));
        let value = match (left.get(name).and_then(Value::as_object), schema.as_object()) {
            (Some(base), Some(branch)) => {
                let base = collapse_all_of(base, &property_path)?;
                Value::Object(merge_schemas(&base, branch, &property_path)?)
            }
            _ => schema.clone(),
        };
        merged.insert(name.clone(), value);
    }
    Ok(Value::Object(merged))
}

fn merge_items(existing: &Value, incoming: &Value, path: &str) -> Result<Value, SchemaError> {
    match (existing.as_object(), incoming.as_object()) {
        (Some(base), Some(branch)) => {
            let items_path = format!("{path}/items");
            let base = collapse_all_of(base, &items_path)?;
            Ok(Value::Object(merge_schemas(&base, branch, &items_path)?))
        }
        _ => Ok(incoming.clone()),
    }
}

fn check_bounds(schema: &SchemaMap, path: &str) -> Result<(), SchemaError> {
    for (lower_keyword, upper_keyword, strict) in BOUND_PAIRS {
        let (Some(lower), Some(upper)) = (schema.get(*lower_keyword), schema.get(*upper_keyword))
        else {
            continue;
        };
        let (Some(lo), Some(hi)) = (lower.as_f64(), upper.as_f64()) else {
            continue;
        };
        if lo > hi || (*strict && lo >= hi) {
            return Err(SchemaError::MergeConflict {
                path: path.to_string(),
                lower_keyword: lower_keyword.to_string(),
                upper_keyword: upper_keyword.to_string(),
                lower: preview(lower),
                upper: preview(upper),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> SchemaMap {
        value.as_object().cloned().unwrap()
    }

    fn merge(a: Value, b: Value) -> Result<SchemaMap, SchemaError> {
        merge_schemas(&map(a), &map(b), "#")
    }

    #[test]
    fn bounds_take_most_restrictive() {
        let merged = merge(
            json!({ "type": "number", "minimum": 1, "maximum": 10 }),
            json!({ "minimum": 3, "maximum": 20 }),
        )
        .unwrap();
        assert_eq!(merged["minimum"], json!(3));
        assert_eq!(merged["maximum"], json!(10));
    }

    #[test]
    fn crossed_bounds_conflict() {
        let err = merge(
            json!({ "type": "string", "minLength": 5 }),
            json!({ "maxLength": 3 }),
        )
        .unwrap_err();
        assert_eq!(err.code(), "MERGE_CONFLICT");
        assert!(err.to_string().contains("minLength"));
    }

    #[test]
    fn enum_intersection() {
        let merged = merge(json!({ "enum": [1, 2, 3] }), json!({ "enum": [2, 3, 4] })).unwrap();
        assert_eq!(merged["enum"], json!([2, 3]));

        let err = merge(json!({ "enum": [1, 2] }), json!({ "enum": [3, 4] })).unwrap_err();
        assert_eq!(err.code(), "EMPTY_ENUM_INTERSECTION");
    }

    #[test]
    fn const_must_agree() {
        assert!(merge(json!({ "const": { "a": 1 } }), json!({ "const": { "a": 1 } })).is_ok());
        let err = merge(json!({ "const": "x" }), json!({ "const": "y" })).unwrap_err();
        assert_eq!(err.code(), "CONFLICTING_CONST");
    }

    #[test]
    fn type_cannot_be_redefined() {
        let err = merge(json!({ "type": "string" }), json!({ "type": "number" })).unwrap_err();
        assert_eq!(err.code(), "TYPE_REDEFINITION");
        assert!(merge(json!({}), json!({ "type": "number" })).is_ok());
    }

    #[test]
    fn patterns_combine_with_lookaheads() {
        let merged = merge(json!({ "pattern": "^a" }), json!({ "pattern": "z$" })).unwrap();
        let pattern = merged["pattern"].as_str().unwrap();
        assert!(pattern.contains("(?=[\\s\\S]*?(?:^a))"));
        assert!(pattern.contains("(?=[\\s\\S]*?(?:z$))"));

        let same = merge(json!({ "pattern": "^a" }), json!({ "pattern": "^a" })).unwrap();
        assert_eq!(same["pattern"], json!("^a"));
    }

    #[test]
    fn first_win_and_overwrite() {
        let merged = merge(
            json!({ "title": "Base", "x-widget": "input" }),
            json!({ "title": "Branch", "description": "added", "x-widget": "select" }),
        )
        .unwrap();
        assert_eq!(merged["title"], json!("Base"));
        assert_eq!(merged["description"], json!("added"));
        assert_eq!(merged["x-widget"], json!("select"));
    }

    #[test]
    fn set_algebra_is_associative() {
        let a = json!({ "enum": [1, 2, 3, 4], "required": ["a"], "minimum": 0 });
        let b = json!({ "enum": [2, 3, 4], "required": ["b"], "minimum": 2 });
        let c = json!({ "enum": [3, 4, 5], "required": ["a", "c"], "minimum": 1 });

        let left = merge_schemas(&merge(a.clone(), b.clone()).unwrap(), &map(c.clone()), "#").unwrap();
        let right = merge_schemas(&map(a), &merge(b, c).unwrap(), "#").unwrap();
        for keyword in ["enum", "required", "minimum"] {
            assert_eq!(left[keyword], right[keyword], "{keyword}");
        }
    }

    #[test]
    fn title_is_not_commutative() {
        let a = json!({ "title": "A" });
        let b = json!({ "title": "B" });
        assert_eq!(merge(a.clone(), b.clone()).unwrap()["title"], json!("A"));
        assert_eq!(merge(b, a).unwrap()["title"], json!("B"));
    }

    #[test]
    fn all_of_unions_properties_idempotently() {
        let x = json!({ "properties": { "extra": { "type": "string" } }, "required": ["extra"] });
        let schema = map(json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "allOf": [x.clone()]
        }));
        let once = collapse_all_of(&schema, "#").unwrap();
        let names: Vec<&String> = once["properties"].as_object().unwrap().keys().collect();
        assert_eq!(names, vec!["name", "extra"]);

        let twice = merge_schemas(&once, &map(x), "#").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn same_named_properties_merge_recursively() {
        let merged = merge(
            json!({ "properties": { "age": { "type": "integer", "minimum": 0, "title": "Age" } } }),
            json!({ "properties": { "age": { "maximum": 120, "title": "Years" } } }),
        )
        .unwrap();
        assert_eq!(
            merged["properties"]["age"],
            json!({ "type": "integer", "minimum": 0, "title": "Age", "maximum": 120 })
        );

        let err = merge(
            json!({ "properties": { "age": { "type": "integer" } } }),
            json!({ "properties": { "age": { "type": "string" } } }),
        )
        .unwrap_err();
        assert_eq!(err.path(), "#/properties/age");
    }
}
