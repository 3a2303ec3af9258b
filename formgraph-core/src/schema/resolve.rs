//! Effective Schema Construction

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use super::compose::{distribute, Distribution};
use super::merge::{collapse_all_of, without, SchemaMap};
use super::{Computed, CompositionBranch, EffectiveSchema, SchemaKind, VirtualField};
use crate::error::{preview, SchemaError};
use crate::expr::{escape_segment, CompiledExpr, RelativePointer};

/// Keywords consumed by resolution. They never reach `keywords`.
const STRUCTURAL_KEYWORDS: &[&str] = &[
    "properties",
    "items",
    "allOf",
    "anyOf",
    "oneOf",
    "computed",
    "virtual",
];

/// Resolve a raw schema document into its effective schema tree.
pub fn resolve(raw: &Value) -> Result<Arc<EffectiveSchema>, SchemaError> {
    let schema = resolve_at(raw, "#")?;
    debug!(kind = %schema.kind, "schema resolved");
    Ok(Arc::new(schema))
}

fn resolve_at(raw: &Value, path: &str) -> Result<EffectiveSchema, SchemaError> {
    let map = raw.as_object().ok_or_else(|| SchemaError::InvalidSchema {
        path: path.to_string(),
        reason: format!("expected a schema object, got {}", preview(raw)),
    })?;

    let collapsed = collapse_all_of(map, path)?;
    let Distribution {
        schema,
        branches: raw_branches,
        conditions,
    } = distribute(collapsed, path)?;

    let kind = infer_kind(&schema, path)?;
    let computed = compile_computed(&schema, path)?;

    let mut properties = IndexMap::new();
    if let Some(declared) = schema.get("properties") {
        let declared = declared.as_object().ok_or_else(|| SchemaError::InvalidSchema {
            path: format!("{path}/properties"),
            reason: format!("properties must be an object, got {}", preview(declared)),
        })?;
        for (name, child) in declared {
            let child_path = format!("{path}/properties/{}", escape_segment(name));
            let mut child = resolve_at(child, &child_path)?;
            if let Some(declaring) = conditions.get(name) {
                child.conditions = declaring.clone();
            }
            properties.insert(name.clone(), Arc::new(child));
        }
    }

    let items = match schema.get("items") {
        None => None,
        Some(items @ Value::Object(_)) => Some(Arc::new(resolve_at(items, &format!("{path}/items"))?)),
        Some(other) => {
            return Err(SchemaError::InvalidSchema {
                path: format!("{path}/items"),
                reason: format!("items must be a single schema, got {}", preview(other)),
            })
        }
    };

    let mut branches = Vec::with_capacity(raw_branches.len());
    for raw in raw_branches {
        let branch_path = format!("{path}/{}/{}", raw.composition.keyword(), raw.index);
        let predicate = match &raw.predicate {
            Some(source) => Some(compile_condition(source, &format!("{branch_path}/if"))?),
            None => None,
        };
        branches.push(CompositionBranch {
            composition: raw.composition,
            index: raw.index,
            predicate,
            required: raw.required,
        });
    }

    let virtual_fields = resolve_virtual_fields(&schema, &properties, path)?;

    let mut effective = EffectiveSchema::new(kind, plain_keywords(&schema));
    effective.properties = properties;
    effective.items = items;
    effective.virtual_fields = virtual_fields;
    effective.computed = computed;
    effective.branches = branches;
    Ok(effective)
}

/// Keywords left once structural and `&`-prefixed keywords are removed.
fn plain_keywords(schema: &SchemaMap) -> SchemaMap {
    without(schema, STRUCTURAL_KEYWORDS)
        .into_iter()
        .filter(|(key, _)| !key.starts_with('&'))
        .collect()
}

fn infer_kind(schema: &SchemaMap, path: &str) -> Result<SchemaKind, SchemaError> {
    match schema.get("type") {
        Some(Value::String(name)) => {
            return SchemaKind::from_type_name(name).ok_or_else(|| SchemaError::InvalidSchema {
                path: path.to_string(),
                reason: format!("unknown type '{name}'"),
            })
        }
        // Nullable unions take their first non-null member.
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            let name = names
                .iter()
                .find(|name| **name != "null")
                .or_else(|| names.first());
            if let Some(kind) = name.and_then(|name| SchemaKind::from_type_name(name)) {
                return Ok(kind);
            }
        }
        Some(other) => {
            return Err(SchemaError::InvalidSchema {
                path: path.to_string(),
                reason: format!("type must be a string or a list, got {}", preview(other)),
            })
        }
        None => {}
    }

    if schema.contains_key("properties") || schema.contains_key("virtual") {
        return Ok(SchemaKind::Object);
    }
    if schema.contains_key("items") {
        return Ok(SchemaKind::Array);
    }
    let sample = schema
        .get("const")
        .or_else(|| {
            schema
                .get("enum")
                .and_then(Value::as_array)
                .and_then(|values| values.first())
        })
        .or_else(|| schema.get("default"));
    match sample {
        Some(Value::Object(_)) => Ok(SchemaKind::Object),
        Some(Value::Array(_)) => Ok(SchemaKind::Array),
        Some(Value::String(_)) => Ok(SchemaKind::String),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(SchemaKind::Integer),
        Some(Value::Number(_)) => Ok(SchemaKind::Number),
        Some(Value::Bool(_)) => Ok(SchemaKind::Boolean),
        Some(Value::Null) => Ok(SchemaKind::Null),
        None => Err(SchemaError::InvalidSchema {
            path: path.to_string(),
            reason: "cannot infer a type".to_string(),
        }),
    }
}

/// Compile a boolean-valued condition: an expression string or a literal bool.
fn compile_condition(source: &Value, path: &str) -> Result<CompiledExpr, SchemaError> {
    match source {
        Value::Bool(_) => Ok(CompiledExpr::constant(source.clone())),
        Value::String(text) => {
            CompiledExpr::compile(text).map_err(|reason| SchemaError::ConditionCompile {
                path: path.to_string(),
                expression: text.clone(),
                reason,
            })
        }
        other => Err(SchemaError::ConditionCompile {
            path: path.to_string(),
            expression: preview(other),
            reason: "expected an expression string or a boolean".to_string(),
        }),
    }
}

/// Find a computed keyword and the schema path it was declared at.
/// `computed.<key>` wins over the `&<key>` shorthand.
fn computed_keyword<'a>(
    schema: &'a SchemaMap,
    block: Option<&'a SchemaMap>,
    key: &str,
    path: &str,
) -> Option<(&'a Value, String)> {
    if let Some(value) = block.and_then(|b| b.get(key)) {
        return Some((value, format!("{path}/computed/{key}")));
    }
    schema
        .get(&format!("&{key}"))
        .map(|value| (value, format!("{path}/&{key}")))
}

fn compile_computed(schema: &SchemaMap, path: &str) -> Result<Computed, SchemaError> {
    let block = match schema.get("computed") {
        None => None,
        Some(Value::Object(block)) => Some(block),
        Some(other) => {
            return Err(SchemaError::InvalidSchema {
                path: format!("{path}/computed"),
                reason: format!("computed must be an object, got {}", preview(other)),
            })
        }
    };

    let lookup = |key: &str| computed_keyword(schema, block, key, path);

    let mut computed = Computed::default();
    if let Some((source, at)) = lookup("visible") {
        computed.visible = Some(compile_condition(source, &at)?);
    }
    if let Some((source, at)) = lookup("readOnly") {
        computed.read_only = Some(compile_condition(source, &at)?);
    }
    if let Some((source, at)) = lookup("disabled") {
        computed.disabled = Some(compile_condition(source, &at)?);
    }
    if let Some((source, at)) = lookup("value") {
        computed.value = Some(match source {
            Value::String(text) => {
                CompiledExpr::compile(text).map_err(|reason| SchemaError::ConditionCompile {
                    path: at,
                    expression: text.clone(),
                    reason,
                })?
            }
            literal => CompiledExpr::constant(literal.clone()),
        });
    }
    if let Some((source, at)) = lookup("watch") {
        let sources: Vec<&Value> = match source {
            Value::Array(list) => list.iter().collect(),
            single => vec![single],
        };
        for source in sources {
            let text = source.as_str().ok_or_else(|| SchemaError::ConditionCompile {
                path: at.clone(),
                expression: preview(source),
                reason: "watch entries must be pointer strings".to_string(),
            })?;
            let pointer =
                RelativePointer::parse(text).map_err(|reason| SchemaError::ConditionCompile {
                    path: at.clone(),
                    expression: text.to_string(),
                    reason,
                })?;
            computed.watch.push(pointer);
        }
    }
    Ok(computed)
}

fn resolve_virtual_fields(
    schema: &SchemaMap,
    properties: &IndexMap<String, Arc<EffectiveSchema>>,
    path: &str,
) -> Result<IndexMap<String, VirtualField>, SchemaError> {
    let mut resolved = IndexMap::new();
    let Some(declared) = schema.get("virtual") else {
        return Ok(resolved);
    };
    let declared = declared.as_object().ok_or_else(|| SchemaError::InvalidSchema {
        path: format!("{path}/virtual"),
        reason: format!("virtual must be an object, got {}", preview(declared)),
    })?;

    for (name, declaration) in declared {
        let field_path = format!("{path}/virtual/{}", escape_segment(name));
        let not_valid = || SchemaError::VirtualFieldsNotValid {
            path: field_path.clone(),
            field: name.clone(),
            preview: preview(declaration),
        };

        let declaration = declaration.as_object().ok_or_else(not_valid)?;
        let fields = declaration
            .get("fields")
            .and_then(Value::as_array)
            .filter(|fields| !fields.is_empty())
            .ok_or_else(not_valid)?;
        let fields: Vec<String> = fields
            .iter()
            .map(|field| field.as_str().map(str::to_string))
            .collect::<Option<_>>()
            .ok_or_else(not_valid)?;

        let missing: Vec<String> = fields
            .iter()
            .filter(|field| !properties.contains_key(field.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::VirtualFieldsNotInProperties {
                path: field_path,
                field: name.clone(),
                missing,
            });
        }
        if properties.contains_key(name) {
            return Err(SchemaError::InvalidSchema {
                path: field_path,
                reason: format!("virtual field '{name}' collides with a declared property"),
            });
        }

        let annotations = without(declaration, &["fields"]);
        let mut virtual_schema = EffectiveSchema::new(SchemaKind::Virtual, plain_keywords(&annotations));
        virtual_schema.computed = compile_computed(&annotations, &field_path)?;
        resolved.insert(
            name.clone(),
            VirtualField {
                fields,
                schema: Arc::new(virtual_schema),
            },
        );
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_objects_in_declared_order() {
        let schema = resolve(&json!({
            "type": "object",
            "properties": {
                "zeta": { "type": "string" },
                "alpha": { "type": "object", "properties": { "n": { "type": "integer" } } }
            }
        }))
        .unwrap();

        let names: Vec<&String> = schema.properties().keys().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        let alpha = schema.property("alpha").unwrap();
        assert_eq!(alpha.kind(), SchemaKind::Object);
        assert_eq!(alpha.property("n").unwrap().kind(), SchemaKind::Integer);
    }

    #[test]
    fn infers_kind_without_type() {
        let schema = resolve(&json!({
            "properties": {
                "tags": { "items": { "type": "string" } },
                "color": { "enum": ["red", "green"] },
                "count": { "default": 3 },
                "maybe": { "type": ["null", "number"] }
            }
        }))
        .unwrap();
        assert_eq!(schema.kind(), SchemaKind::Object);
        assert_eq!(schema.property("tags").unwrap().kind(), SchemaKind::Array);
        assert_eq!(schema.property("color").unwrap().kind(), SchemaKind::String);
        assert_eq!(schema.property("count").unwrap().kind(), SchemaKind::Integer);
        assert_eq!(schema.property("maybe").unwrap().kind(), SchemaKind::Number);

        let err = resolve(&json!({ "title": "nothing" })).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
    }

    #[test]
    fn all_of_merges_before_properties_resolve() {
        let schema = resolve(&json!({
            "type": "object",
            "properties": { "age": { "type": "integer", "minimum": 0 } },
            "allOf": [
                { "properties": { "age": { "minimum": 18 } }, "required": ["age"] }
            ]
        }))
        .unwrap();
        let age = schema.property("age").unwrap();
        assert_eq!(age.keyword("minimum"), Some(&json!(18)));
        assert_eq!(schema.required().collect::<Vec<_>>(), vec!["age"]);
    }

    #[test]
    fn distributed_properties_carry_conditions() {
        let schema = resolve(&json!({
            "type": "object",
            "properties": { "kind": { "type": "string" } },
            "oneOf": [
                { "&if": "./kind == 'a'", "properties": { "x": { "type": "string" } } },
                { "computed": { "if": "./kind == 'b'" }, "properties": { "x": { "type": "string" } }, "required": ["x"] }
            ]
        }))
        .unwrap();

        assert_eq!(schema.property("x").unwrap().conditions(), &[0, 1]);
        assert!(schema.property("kind").unwrap().conditions().is_empty());
        assert_eq!(schema.branches().len(), 2);
        assert_eq!(schema.branches()[1].required, vec!["x"]);
        assert_eq!(
            schema.branches()[0].predicate.as_ref().unwrap().source(),
            "./kind == 'a'"
        );
    }

    #[test]
    fn compiles_computed_keywords_and_shorthands() {
        let schema = resolve(&json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": {
                    "type": "number",
                    "&visible": "../a > 0",
                    "computed": { "value": "../a * 2", "watch": ["../a", "#/a"] },
                    "&readOnly": true
                }
            }
        }))
        .unwrap();

        let b = schema.property("b").unwrap();
        assert_eq!(b.computed().visible.as_ref().unwrap().source(), "../a > 0");
        assert_eq!(b.computed().value.as_ref().unwrap().source(), "../a * 2");
        assert_eq!(b.computed().watch.len(), 2);
        assert!(b.computed().read_only.is_some());
        assert!(b.keyword("&visible").is_none());
        assert!(b.keyword("computed").is_none());
    }

    #[test]
    fn bad_expressions_fail_at_resolution() {
        let err = resolve(&json!({
            "type": "object",
            "properties": { "a": { "type": "string", "&visible": "../b ===" } }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "CONDITION_COMPILE");
        assert_eq!(err.path(), "#/properties/a/&visible");

        let err = resolve(&json!({
            "type": "object",
            "properties": { "a": { "type": "string", "computed": { "watch": ["nope"] } } }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "CONDITION_COMPILE");
    }

    #[test]
    fn virtual_field_declarations_are_checked() {
        let ok = resolve(&json!({
            "type": "object",
            "properties": { "from": { "type": "number" }, "to": { "type": "number" } },
            "virtual": { "range": { "fields": ["from", "to"], "title": "Range" } }
        }))
        .unwrap();
        let range = &ok.virtual_fields()["range"];
        assert_eq!(range.fields, vec!["from", "to"]);
        assert_eq!(range.schema.kind(), SchemaKind::Virtual);
        assert_eq!(range.schema.title(), Some("Range"));

        let err = resolve(&json!({
            "type": "object",
            "properties": { "from": { "type": "number" } },
            "virtual": { "range": { "fields": [] } }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "VIRTUAL_FIELDS_NOT_VALID");

        let err = resolve(&json!({
            "type": "object",
            "properties": { "from": { "type": "number" } },
            "virtual": { "range": { "fields": ["from", "to"] } }
        }))
        .unwrap_err();
        match err {
            SchemaError::VirtualFieldsNotInProperties { missing, .. } => {
                assert_eq!(missing, vec!["to"])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn to_json_strips_runtime_keywords() {
        let schema = resolve(&json!({
            "type": "object",
            "properties": { "kind": { "type": "string", "&visible": true } },
            "anyOf": [ { "properties": { "extra": { "type": "number" } } } ],
            "virtual": { "v": { "fields": ["kind"] } },
            "required": ["kind"]
        }))
        .unwrap();

        assert_eq!(
            schema.to_json(),
            json!({
                "type": "object",
                "required": ["kind"],
                "properties": {
                    "kind": { "type": "string" },
                    "extra": { "type": "number" }
                }
            })
        );
    }
}
