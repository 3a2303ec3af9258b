//! `anyOf` / `oneOf` Distribution
//!
//! Instead of keeping alternative branches around, the properties declared
//! by each branch are lifted into the parent's `properties`. Every lifted
//! property remembers which branches declared it; at runtime it is active
//! when any of those branches' predicates holds.
//!
//! Two structural rules apply:
//!
//! - a branch may not redeclare a property the parent already owns
//!   ([`SchemaError::CompositionPropertyRedefinition`]);
//! - sibling branches of one composition that declare the same property
//!   must declare it identically
//!   ([`SchemaError::CompositionPropertyExclusiveness`]).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::merge::{collapse_all_of, without, SchemaMap};
use crate::error::{preview, SchemaError};

/// The composition keyword a branch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Composition {
    AnyOf,
    OneOf,
}

impl Composition {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::AnyOf => "anyOf",
            Self::OneOf => "oneOf",
        }
    }
}

/// A branch as found in the schema, predicate not yet compiled.
#[derive(Debug, Clone)]
pub(crate) struct RawBranch {
    pub composition: Composition,
    pub index: usize,
    pub predicate: Option<Value>,
    pub required: Vec<String>,
}

/// A schema with its compositions lifted into `properties`.
#[derive(Debug, Clone)]
pub(crate) struct Distribution {
    pub schema: SchemaMap,
    pub branches: Vec<RawBranch>,
    /// Property name to the indices (into `branches`) of the branches declaring it.
    pub conditions: IndexMap<String, Vec<usize>>,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn branch_predicate(branch: &SchemaMap) -> Option<Value> {
    branch
        .get("computed")
        .and_then(|computed| computed.get("if"))
        .or_else(|| branch.get("&if"))
        .cloned()
}

/// Lift `anyOf`/`oneOf` branch properties into the parent schema.
pub(crate) fn distribute(schema: SchemaMap, path: &str) -> Result<Distribution, SchemaError> {
    if !schema.contains_key("anyOf") && !schema.contains_key("oneOf") {
        return Ok(Distribution {
            schema,
            branches: Vec::new(),
            conditions: IndexMap::new(),
        });
    }

    let mut properties: SchemaMap = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let base_type = schema.get("type");
    let mut branches = Vec::new();
    let mut conditions: IndexMap<String, Vec<usize>> = IndexMap::new();

    for composition in [Composition::AnyOf, Composition::OneOf] {
        let keyword = composition.keyword();
        let Some(list) = schema.get(keyword) else {
            continue;
        };
        let list = list.as_array().ok_or_else(|| SchemaError::InvalidSchema {
            path: format!("{path}/{keyword}"),
            reason: format!("{keyword} must be an array, got {}", preview(list)),
        })?;

        // Property name to (first declaring branch, definition) within this composition.
        let mut declared: IndexMap<String, (usize, Value)> = IndexMap::new();

        for (index, branch) in list.iter().enumerate() {
            let branch_path = format!("{path}/{keyword}/{index}");
            let branch = branch.as_object().ok_or_else(|| SchemaError::InvalidSchema {
                path: branch_path.clone(),
                reason: format!("{keyword} branch must be an object, got {}", preview(branch)),
            })?;
            let branch = collapse_all_of(branch, &branch_path)?;

            if let (Some(base), Some(own)) = (base_type, branch.get("type")) {
                if base != own {
                    return Err(SchemaError::TypeRedefinition {
                        path: branch_path,
                        base: preview(base),
                        branch: preview(own),
                    });
                }
            }

            let global = branches.len();
            let branch_properties = branch.get("properties").and_then(Value::as_object);
            for (name, definition) in branch_properties.into_iter().flatten() {
                match declared.get(name) {
                    Some((first, existing)) => {
                        if existing != definition {
                            return Err(SchemaError::CompositionPropertyExclusiveness {
                                path: path.to_string(),
                                composition: keyword.to_string(),
                                property: name.clone(),
                                first: *first,
                                second: index,
                                preview: preview(definition),
                            });
                        }
                    }
                    None => {
                        if properties.contains_key(name) {
                            return Err(SchemaError::CompositionPropertyRedefinition {
                                path: path.to_string(),
                                composition: keyword.to_string(),
                                branch: index,
                                property: name.clone(),
                            });
                        }
                        declared.insert(name.clone(), (index, definition.clone()));
                        properties.insert(name.clone(), definition.clone());
                    }
                }
                conditions.entry(name.clone()).or_default().push(global);
            }

            branches.push(RawBranch {
                composition,
                index,
                predicate: branch_predicate(&branch),
                required: string_list(branch.get("required")),
            });
        }
    }

    let mut lifted = without(&schema, &["anyOf", "oneOf", "properties"]);
    lifted.insert("properties".to_string(), Value::Object(properties));

    Ok(Distribution {
        schema: lifted,
        branches,
        conditions,
    })
}
