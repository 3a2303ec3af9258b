//! Error Taxonomy
//!
//! Two tiers of failure exist in the form core:
//!
//! - [`SchemaError`] covers structural problems: contradictions found while
//!   merging sub-schemas, malformed virtual-field declarations and expressions
//!   that fail to compile. They are raised once, while the schema is resolved
//!   or the tree is built, and are fatal to that subtree.
//!
//! - [`FormError`] wraps the structural tier and adds runtime invariant
//!   violations (feedback loops, malformed virtual values, unknown nodes).
//!
//! Validation errors are not part of this taxonomy. They are plain data and
//! live in [`crate::validation::ValidationError`].
//!
//! Every variant has a stable [`code`](SchemaError::code) meant for grepping
//! logs and matching in callers.

use serde_json::Value;
use thiserror::Error;

/// Longest JSON preview embedded into an error message.
const PREVIEW_LIMIT: usize = 80;

/// Render a short, single-line JSON preview of a value for diagnostics.
pub fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= PREVIEW_LIMIT {
        return text;
    }
    let mut cut: String = text.chars().take(PREVIEW_LIMIT).collect();
    cut.push_str("...");
    cut
}

/// Structural errors raised while resolving a schema or building nodes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// A lower bound ended up above its upper bound after a merge.
    #[error("[MERGE_CONFLICT] {path}: {lower_keyword}={lower} exceeds {upper_keyword}={upper}")]
    MergeConflict {
        path: String,
        lower_keyword: String,
        upper_keyword: String,
        lower: String,
        upper: String,
    },

    /// Two `enum` lists share no value.
    #[error("[EMPTY_ENUM_INTERSECTION] {path}: enum {left} and enum {right} have no common value")]
    EmptyEnumIntersection {
        path: String,
        left: String,
        right: String,
    },

    /// Two `const` values differ.
    #[error("[CONFLICTING_CONST] {path}: const {left} conflicts with const {right}")]
    ConflictingConst {
        path: String,
        left: String,
        right: String,
    },

    /// A branch tried to change the `type` of the schema it is merged into.
    #[error("[TYPE_REDEFINITION] {path}: type {base} cannot be redefined as {branch}")]
    TypeRedefinition {
        path: String,
        base: String,
        branch: String,
    },

    /// An `anyOf`/`oneOf` branch redeclares a property the parent already owns.
    #[error("[COMPOSITION_PROPERTY_REDEFINITION] {path}: {composition} branch {branch} redefines property '{property}'")]
    CompositionPropertyRedefinition {
        path: String,
        composition: String,
        branch: usize,
        property: String,
    },

    /// Sibling branches of one composition declare the same property differently.
    #[error("[COMPOSITION_PROPERTY_EXCLUSIVENESS] {path}: property '{property}' differs between {composition} branches {first} and {second}: {preview}")]
    CompositionPropertyExclusiveness {
        path: String,
        composition: String,
        property: String,
        first: usize,
        second: usize,
        preview: String,
    },

    /// An expression or pointer could not be compiled.
    #[error("[CONDITION_COMPILE] {path}: cannot compile `{expression}`: {reason}")]
    ConditionCompile {
        path: String,
        expression: String,
        reason: String,
    },

    /// A virtual field declaration is not `{ fields: [string, ...] }`.
    #[error("[VIRTUAL_FIELDS_NOT_VALID] {path}: virtual field '{field}' needs a non-empty `fields` array of strings, got {preview}")]
    VirtualFieldsNotValid {
        path: String,
        field: String,
        preview: String,
    },

    /// A virtual field references properties the object does not declare.
    #[error("[VIRTUAL_FIELDS_NOT_IN_PROPERTIES] {path}: virtual field '{field}' references unknown properties {missing:?}")]
    VirtualFieldsNotInProperties {
        path: String,
        field: String,
        missing: Vec<String>,
    },

    /// The document is not a usable schema at this location.
    #[error("[INVALID_SCHEMA] {path}: {reason}")]
    InvalidSchema { path: String, reason: String },
}

impl SchemaError {
    /// Stable code identifying the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MergeConflict { .. } => "MERGE_CONFLICT",
            Self::EmptyEnumIntersection { .. } => "EMPTY_ENUM_INTERSECTION",
            Self::ConflictingConst { .. } => "CONFLICTING_CONST",
            Self::TypeRedefinition { .. } => "TYPE_REDEFINITION",
            Self::CompositionPropertyRedefinition { .. } => "COMPOSITION_PROPERTY_REDEFINITION",
            Self::CompositionPropertyExclusiveness { .. } => "COMPOSITION_PROPERTY_EXCLUSIVENESS",
            Self::ConditionCompile { .. } => "CONDITION_COMPILE",
            Self::VirtualFieldsNotValid { .. } => "VIRTUAL_FIELDS_NOT_VALID",
            Self::VirtualFieldsNotInProperties { .. } => "VIRTUAL_FIELDS_NOT_IN_PROPERTIES",
            Self::InvalidSchema { .. } => "INVALID_SCHEMA",
        }
    }

    /// Schema path the error was raised at.
    pub fn path(&self) -> &str {
        match self {
            Self::MergeConflict { path, .. }
            | Self::EmptyEnumIntersection { path, .. }
            | Self::ConflictingConst { path, .. }
            | Self::TypeRedefinition { path, .. }
            | Self::CompositionPropertyRedefinition { path, .. }
            | Self::CompositionPropertyExclusiveness { path, .. }
            | Self::ConditionCompile { path, .. }
            | Self::VirtualFieldsNotValid { path, .. }
            | Self::VirtualFieldsNotInProperties { path, .. }
            | Self::InvalidSchema { path, .. } => path,
        }
    }
}

/// Errors surfaced by the form tree.
#[derive(Debug, Error)]
pub enum FormError {
    /// Structural schema error.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Computed values kept feeding back into each other.
    #[error("[INFINITE_LOOP_DETECTED] {path}: computed values did not settle after {batches} batches (dependencies: {dependencies:?})")]
    InfiniteLoopDetected {
        path: String,
        dependencies: Vec<String>,
        batches: usize,
    },

    /// A virtual node received a value that is not `undefined` or a tuple of the right length.
    #[error("[INVALID_VIRTUAL_NODE_VALUES] {path}: expected undefined or an array of {expected} values, got {preview}")]
    InvalidVirtualNodeValues {
        path: String,
        expected: usize,
        preview: String,
    },

    /// No node lives at the given path or id.
    #[error("[NODE_NOT_FOUND] {0}")]
    NodeNotFound(String),

    /// The operation does not apply to this kind of node.
    #[error("[UNSUPPORTED_OPERATION] {path}: {operation} is not supported on {kind} nodes")]
    UnsupportedOperation {
        path: String,
        operation: &'static str,
        kind: &'static str,
    },

    /// Options could not be parsed.
    #[error("[CONFIG] {0}")]
    Config(String),
}

impl FormError {
    /// Stable code identifying the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(err) => err.code(),
            Self::InfiniteLoopDetected { .. } => "INFINITE_LOOP_DETECTED",
            Self::InvalidVirtualNodeValues { .. } => "INVALID_VIRTUAL_NODE_VALUES",
            Self::NodeNotFound(_) => "NODE_NOT_FOUND",
            Self::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            Self::Config(_) => "CONFIG",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = FormError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_truncates_long_values() {
        let long = json!({ "text": "x".repeat(200) });
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), PREVIEW_LIMIT + 3);
        assert_eq!(preview(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn codes_are_stable() {
        let err = SchemaError::EmptyEnumIntersection {
            path: "#".into(),
            left: "[1]".into(),
            right: "[2]".into(),
        };
        assert_eq!(err.code(), "EMPTY_ENUM_INTERSECTION");
        assert!(err.to_string().starts_with("[EMPTY_ENUM_INTERSECTION] #"));

        let wrapped = FormError::from(err);
        assert_eq!(wrapped.code(), "EMPTY_ENUM_INTERSECTION");
    }
}
