//! Form Nodes
//!
//! This module defines the node types that live in the form tree.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::reactive::{DependencyIndex, EventBus};
use crate::schema::{EffectiveSchema, SchemaKind};
use crate::validation::ErrorSlots;

/// Unique identifier for a node in the form tree.
///
/// Identifiers are never reused, so an array element keeps its id while its
/// exposed position (`name`) is renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-kind storage of an object node.
#[derive(Debug, Default)]
pub struct ObjectState {
    /// Declared properties in schema order, then virtual fields.
    pub(crate) children: IndexMap<String, NodeId>,
    /// Latest defined value of every declared child, keyed by name.
    pub(crate) draft: IndexMap<String, Value>,
    /// Undeclared keys carried through from the last wholesale value.
    pub(crate) extras: Map<String, Value>,
    /// Activation of each `anyOf`/`oneOf` branch of the schema.
    pub(crate) branch_states: Vec<bool>,
}

/// Per-kind storage of an array node.
#[derive(Debug, Default)]
pub struct ArrayState {
    /// Elements in index order.
    pub(crate) children: Vec<NodeId>,
}

/// Per-kind storage of a virtual node.
#[derive(Debug, Default)]
pub struct VirtualState {
    /// Aggregated sibling nodes, in slot order. Not owned.
    pub(crate) references: Vec<NodeId>,
}

/// Kind-specific part of a node.
#[derive(Debug)]
pub enum NodeKind {
    Object(ObjectState),
    Array(ArrayState),
    Virtual(VirtualState),
    /// String, number, integer, boolean and null fields.
    Leaf,
}

/// A node in the form tree.
pub struct FormNode {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) depth: usize,
    pub(crate) schema: Arc<EffectiveSchema>,
    pub(crate) kind: NodeKind,
    /// `None` is an undefined value.
    pub(crate) value: Option<Value>,
    pub(crate) default_value: Option<Value>,
    pub(crate) state: Map<String, Value>,
    pub(crate) errors: ErrorSlots,
    pub(crate) bus: EventBus,
    /// Expressions re-evaluated when a watched path changes.
    pub(crate) index: DependencyIndex,
    /// Cleared while children are still being built.
    pub(crate) ready: bool,
    /// Nesting depth of bulk writes; emission waits until it is zero.
    pub(crate) suppress: usize,
}

impl FormNode {
    pub(crate) fn new(
        parent: Option<NodeId>,
        name: String,
        path: String,
        depth: usize,
        schema: Arc<EffectiveSchema>,
    ) -> Self {
        let kind = match schema.kind() {
            SchemaKind::Object => NodeKind::Object(ObjectState {
                branch_states: vec![true; schema.branches().len()],
                ..ObjectState::default()
            }),
            SchemaKind::Array => NodeKind::Array(ArrayState::default()),
            SchemaKind::Virtual => NodeKind::Virtual(VirtualState::default()),
            _ => NodeKind::Leaf,
        };

        let mut state = Map::new();
        state.insert("visible".to_string(), Value::Bool(true));
        state.insert("active".to_string(), Value::Bool(true));
        state.insert("readOnly".to_string(), Value::Bool(schema.read_only()));
        state.insert("disabled".to_string(), Value::Bool(false));

        Self {
            id: NodeId::new(),
            parent,
            name,
            path,
            depth,
            schema,
            kind,
            value: None,
            default_value: None,
            state,
            errors: ErrorSlots::default(),
            bus: EventBus::new(),
            index: DependencyIndex::default(),
            ready: false,
            suppress: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Segment under the parent: a property name or an array index.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// JSON pointer from the root; `""` for the root itself.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn schema(&self) -> &Arc<EffectiveSchema> {
        &self.schema
    }

    pub fn schema_kind(&self) -> SchemaKind {
        self.schema.kind()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// Free-form flags, including the computed `visible`, `active`,
    /// `readOnly`, `disabled` and `watchValues`.
    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub(crate) fn flag(&self, key: &str) -> bool {
        self.state.get(key).and_then(Value::as_bool).unwrap_or(true)
    }

    pub fn is_read_only(&self) -> bool {
        self.state.get("readOnly").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_disabled(&self) -> bool {
        self.state.get("disabled").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn errors(&self) -> &ErrorSlots {
        &self.errors
    }

    /// Children in exposed order. Virtual nodes come after declared properties.
    pub fn children(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Object(state) => state.children.values().copied().collect(),
            NodeKind::Array(state) => state.children.clone(),
            NodeKind::Virtual(_) | NodeKind::Leaf => Vec::new(),
        }
    }

    pub(crate) fn child(&self, name: &str) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Object(state) => state.children.get(name).copied(),
            NodeKind::Array(state) => name
                .parse::<usize>()
                .ok()
                .and_then(|index| state.children.get(index).copied()),
            NodeKind::Virtual(_) | NodeKind::Leaf => None,
        }
    }

    /// Label used in `UnsupportedOperation` errors.
    pub(crate) fn kind_label(&self) -> &'static str {
        self.schema.kind().as_str()
    }
}

impl fmt::Debug for FormNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormNode")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.schema.kind())
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::resolve;
    use serde_json::json;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn new_node_starts_visible_and_not_ready() {
        let schema = resolve(&json!({
            "type": "object",
            "properties": { "a": { "type": "string", "readOnly": true } },
            "anyOf": [ { "properties": { "b": { "type": "number" } } } ]
        }))
        .unwrap();

        let node = FormNode::new(None, String::new(), String::new(), 0, Arc::clone(&schema));
        assert!(!node.ready);
        assert!(node.flag("visible"));
        assert!(!node.is_read_only());
        match node.kind() {
            NodeKind::Object(state) => assert_eq!(state.branch_states, vec![true]),
            other => panic!("unexpected kind {other:?}"),
        }

        let leaf_schema = Arc::clone(schema.property("a").unwrap());
        let leaf = FormNode::new(Some(node.id()), "a".into(), "/a".into(), 1, leaf_schema);
        assert!(leaf.is_read_only());
        assert!(leaf.children().is_empty());
    }
}
