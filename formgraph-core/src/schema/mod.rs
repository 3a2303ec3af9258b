//! Schema Resolution
//!
//! Turns a raw JSON Schema document into a tree of [`EffectiveSchema`]s, one
//! per field, before any node exists.
//!
//! # Pipeline
//!
//! For every schema object, top-down:
//!
//! 1. `allOf` branches are merged into the schema ([`merge`]).
//! 2. `anyOf`/`oneOf` branch properties are lifted into `properties`, each
//!    remembering the branches that declared it ([`compose`]).
//! 3. The field kind is inferred, computed keywords are compiled and
//!    `properties`, `items` and `virtual` declarations are resolved
//!    recursively ([`resolve`]).
//!
//! Every contradiction is a [`SchemaError`](crate::error::SchemaError) raised
//! here, so the node graph can assume a contradiction-free schema. Effective
//! schemas are immutable and shared through `Arc`.

mod compose;
mod merge;
mod resolve;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::expr::{CompiledExpr, RelativePointer};

pub use compose::Composition;
pub use merge::{collapse_all_of, merge_schemas, SchemaMap, FIRST_WIN_KEYWORDS};
pub use resolve::resolve;

/// The shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
    /// Aggregates sibling fields into a tuple. Declared through `virtual`.
    Virtual,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
            Self::Virtual => "virtual",
        }
    }

    pub(crate) fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    /// Whether nodes of this kind own children.
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled `computed` keywords of a field.
#[derive(Debug, Clone, Default)]
pub struct Computed {
    pub visible: Option<CompiledExpr>,
    pub read_only: Option<CompiledExpr>,
    pub disabled: Option<CompiledExpr>,
    /// Derives the field's value.
    pub value: Option<CompiledExpr>,
    /// Pointers whose values are published as the `watchValues` state.
    pub watch: Vec<RelativePointer>,
}

impl Computed {
    pub fn is_empty(&self) -> bool {
        self.visible.is_none()
            && self.read_only.is_none()
            && self.disabled.is_none()
            && self.value.is_none()
            && self.watch.is_empty()
    }
}

/// One `anyOf`/`oneOf` branch after distribution.
#[derive(Debug, Clone)]
pub struct CompositionBranch {
    pub composition: Composition,
    /// Position inside its composition keyword.
    pub index: usize,
    /// Activation predicate. A branch without one is always active.
    pub predicate: Option<CompiledExpr>,
    /// Properties that become required while the branch is active.
    pub required: Vec<String>,
}

/// A `virtual` declaration of an object schema.
#[derive(Debug, Clone)]
pub struct VirtualField {
    /// Sibling properties aggregated into the tuple, in slot order.
    pub fields: Vec<String>,
    pub schema: Arc<EffectiveSchema>,
}

/// A field's schema after composition keywords are resolved.
#[derive(Debug, Clone)]
pub struct EffectiveSchema {
    pub(crate) kind: SchemaKind,
    /// Constraint and annotation keywords, structural keywords removed.
    pub(crate) keywords: SchemaMap,
    pub(crate) properties: IndexMap<String, Arc<EffectiveSchema>>,
    pub(crate) items: Option<Arc<EffectiveSchema>>,
    pub(crate) virtual_fields: IndexMap<String, VirtualField>,
    pub(crate) computed: Computed,
    /// Indices into the parent's `branches` that declared this property.
    pub(crate) conditions: Vec<usize>,
    pub(crate) branches: Vec<CompositionBranch>,
}

impl EffectiveSchema {
    pub(crate) fn new(kind: SchemaKind, keywords: SchemaMap) -> Self {
        Self {
            kind,
            keywords,
            properties: IndexMap::new(),
            items: None,
            virtual_fields: IndexMap::new(),
            computed: Computed::default(),
            conditions: Vec::new(),
            branches: Vec::new(),
        }
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn keywords(&self) -> &SchemaMap {
        &self.keywords
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.get(name)
    }

    pub fn title(&self) -> Option<&str> {
        self.keyword("title").and_then(Value::as_str)
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.keyword("default")
    }

    /// Names listed in the schema's own `required`.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.keyword("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }

    pub fn min_items(&self) -> Option<usize> {
        self.keyword("minItems")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    pub fn max_items(&self) -> Option<usize> {
        self.keyword("maxItems")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    /// `false` only when `additionalProperties: false` is declared.
    pub fn additional_properties_allowed(&self) -> bool {
        self.keyword("additionalProperties") != Some(&Value::Bool(false))
    }

    /// The static `readOnly` annotation.
    pub fn read_only(&self) -> bool {
        self.keyword("readOnly") == Some(&Value::Bool(true))
    }

    pub fn properties(&self) -> &IndexMap<String, Arc<EffectiveSchema>> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Arc<EffectiveSchema>> {
        self.properties.get(name)
    }

    pub fn items(&self) -> Option<&Arc<EffectiveSchema>> {
        self.items.as_ref()
    }

    pub fn virtual_fields(&self) -> &IndexMap<String, VirtualField> {
        &self.virtual_fields
    }

    pub fn computed(&self) -> &Computed {
        &self.computed
    }

    pub fn conditions(&self) -> &[usize] {
        &self.conditions
    }

    pub fn branches(&self) -> &[CompositionBranch] {
        &self.branches
    }

    /// Serialize back to a plain JSON Schema for validators.
    ///
    /// Computed keywords, virtual declarations and compositions are gone;
    /// distributed branch properties appear under `properties`.
    pub fn to_json(&self) -> Value {
        let mut out = self.keywords.clone();
        if !self.properties.is_empty() {
            let properties = self
                .properties
                .iter()
                .map(|(name, schema)| (name.clone(), schema.to_json()))
                .collect();
            out.insert("properties".to_string(), Value::Object(properties));
        }
        if let Some(items) = &self.items {
            out.insert("items".to_string(), items.to_json());
        }
        Value::Object(out)
    }
}
