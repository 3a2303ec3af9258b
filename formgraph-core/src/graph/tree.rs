//! Form Tree
//!
//! The tree owns every node in an arena keyed by [`NodeId`]. A child knows
//! its parent only by id; the parent is notified through explicit calls, not
//! stored callbacks.
//!
//! # Propagation
//!
//! Writes enter through [`FormTree::set_value`] (or `push`/`remove`) and run
//! synchronously:
//!
//! 1. the written node stores its new value and publishes `Change`;
//! 2. its parent folds the value into its draft and re-emits, up to the root;
//! 3. expressions watching any changed path are re-evaluated in dependency
//!    order, feeding derived values back through step 1;
//! 4. once everything settled, a root change is reported to the change sink
//!    and queued for validation exactly once.
//!
//! A wholesale write of an object or array suppresses emission while its
//! children are rewritten, so N child writes leave the composite with a
//! single outward `Change`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::coerce::coerce;
use super::node::{FormNode, NodeId, NodeKind, ObjectState, VirtualState};
use crate::config::FormOptions;
use crate::error::{preview, FormError, Result};
use crate::expr::{join_pointer, split_pointer};
use crate::reactive::{ChangeEvent, ExprRef, SubscriberId};
use crate::schema::{resolve, EffectiveSchema, SchemaKind, VirtualField};
use crate::validation::DistributorState;

/// Callback receiving the root value after every settled change.
pub type ChangeSink = Box<dyn Fn(&Value) + Send + Sync>;

/// The node graph of one form.
pub struct FormTree {
    pub(crate) nodes: BTreeMap<NodeId, FormNode>,
    pub(crate) root: NodeId,
    pub(crate) schema: Arc<EffectiveSchema>,
    /// The effective root schema, before active branch requirements are
    /// layered on for a pass.
    pub(crate) validation_schema: Arc<Value>,
    pub(crate) options: FormOptions,
    /// Reference node to the virtual nodes aggregating it.
    pub(crate) virtual_links: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
    /// Nodes whose dependency index is not empty.
    pub(crate) hosts: BTreeSet<NodeId>,
    /// Paths written since the last flush.
    pub(crate) dirty: Vec<Vec<String>>,
    /// Expressions to evaluate regardless of dirty paths (new nodes).
    pub(crate) pending: BTreeSet<ExprRef>,
    pub(crate) root_changed: bool,
    pub(crate) sink: Option<ChangeSink>,
    pub(crate) validation: DistributorState,
}

impl FormTree {
    /// Resolve `schema` and build the tree, seeded with `value`.
    pub fn new(schema: &Value, value: Option<Value>, options: FormOptions) -> Result<Self> {
        let effective = resolve(schema)?;
        Self::from_effective(effective, value, options)
    }

    /// Build the tree for an already resolved schema.
    pub fn from_effective(
        schema: Arc<EffectiveSchema>,
        value: Option<Value>,
        options: FormOptions,
    ) -> Result<Self> {
        let mut tree = Self {
            nodes: BTreeMap::new(),
            root: NodeId::default(),
            validation_schema: Arc::new(schema.to_json()),
            schema: Arc::clone(&schema),
            options,
            virtual_links: HashMap::new(),
            hosts: BTreeSet::new(),
            dirty: Vec::new(),
            pending: BTreeSet::new(),
            root_changed: false,
            sink: None,
            validation: DistributorState::default(),
        };

        tree.root = tree.build(None, String::new(), schema, value)?;
        // Every expression sees the initial values once.
        tree.dirty.push(Vec::new());
        tree.flush()?;
        tree.root_changed = false;
        if tree.options.validate_on_init {
            tree.queue_validation(true);
        }
        debug!(nodes = tree.nodes.len(), "form tree built");
        Ok(tree)
    }

    /// Install a callback receiving the root value after every settled change.
    pub fn with_change_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&FormNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_ref(&self, id: NodeId) -> Result<&FormNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| FormError::NodeNotFound(id.to_string()))
    }

    /// Find the node at a JSON pointer (`""` is the root).
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for segment in split_pointer(path) {
            current = self.nodes.get(&current)?.child(&segment)?;
        }
        Some(current)
    }

    /// The deepest existing node on the way to `path`.
    pub(crate) fn nearest(&self, path: &str) -> NodeId {
        let mut current = self.root;
        for segment in split_pointer(path) {
            match self.nodes.get(&current).and_then(|n| n.child(&segment)) {
                Some(child) => current = child,
                None => break,
            }
        }
        current
    }

    /// The root value; `null` while undefined.
    pub fn value(&self) -> Value {
        self.nodes
            .get(&self.root)
            .and_then(|n| n.value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes.get(&id).map(FormNode::children).unwrap_or_default()
    }

    pub fn schema(&self) -> &Arc<EffectiveSchema> {
        &self.schema
    }

    pub fn validation_schema(&self) -> &Arc<Value> {
        &self.validation_schema
    }

    pub fn options(&self) -> &FormOptions {
        &self.options
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        out
    }

    /// `id` and everything below it, parents first.
    pub(crate) fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                stack.extend(node.children().into_iter().rev());
            }
        }
        out
    }

    /// Effective visibility: the node's own `visible` and `active` flags and
    /// those of every ancestor.
    pub fn is_visible(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current.and_then(|id| self.nodes.get(&id)) {
            if !node.flag("visible") || !node.flag("active") {
                return false;
            }
            current = node.parent;
        }
        true
    }

    /// Whether the parent requires this node, directly or through an active
    /// composition branch.
    pub fn is_required(&self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        let Some(parent) = node.parent.and_then(|p| self.nodes.get(&p)) else {
            return false;
        };
        if parent.schema.required().any(|name| name == node.name) {
            return true;
        }
        let NodeKind::Object(state) = &parent.kind else {
            return false;
        };
        parent
            .schema
            .branches()
            .iter()
            .zip(&state.branch_states)
            .any(|(branch, active)| *active && branch.required.iter().any(|n| *n == node.name))
    }

    /// Replace the value of a node. `None` makes it undefined.
    pub fn set_value(&mut self, id: NodeId, value: Option<Value>) -> Result<()> {
        self.node_ref(id)?;
        self.write_value(id, value)?;
        self.settle()
    }

    pub fn set_value_at(&mut self, path: &str, value: Option<Value>) -> Result<()> {
        let id = self
            .find(path)
            .ok_or_else(|| FormError::NodeNotFound(path.to_string()))?;
        self.set_value(id, value)
    }

    /// Drop a node's value. Arrays lose every element.
    pub fn clear(&mut self, id: NodeId) -> Result<()> {
        self.set_value(id, None)
    }

    /// Append an element to an array node.
    ///
    /// Returns `None`, leaving the array untouched, when it already holds
    /// `maxItems` elements.
    pub fn push(&mut self, id: NodeId, value: Option<Value>) -> Result<Option<NodeId>> {
        let node = self.node_ref(id)?;
        let unsupported = || FormError::UnsupportedOperation {
            path: node.path.clone(),
            operation: "push",
            kind: node.kind_label(),
        };
        let NodeKind::Array(state) = &node.kind else {
            return Err(unsupported());
        };
        let items = node.schema.items().cloned().ok_or_else(unsupported)?;
        if let Some(max) = node.schema.max_items() {
            if state.children.len() >= max {
                debug!(path = %node.path, max, "push ignored at maxItems");
                return Ok(None);
            }
        }

        let child = self.build_element(id, items, value)?;
        self.mark_dirty(child);
        self.emit(id);
        self.settle()?;
        if let Some(node) = self.nodes.get(&child) {
            debug!(path = %node.path, "element pushed");
        }
        Ok(Some(child))
    }

    /// Remove the element at `index` of an array node.
    pub fn remove(&mut self, id: NodeId, index: usize) -> Result<()> {
        let node = self.node_ref(id)?;
        let NodeKind::Array(state) = &node.kind else {
            return Err(FormError::UnsupportedOperation {
                path: node.path.clone(),
                operation: "remove",
                kind: node.kind_label(),
            });
        };
        let Some(&child) = state.children.get(index) else {
            return Err(FormError::NodeNotFound(join_pointer(
                &node.path,
                &index.to_string(),
            )));
        };
        debug!(path = %node.path, index, "element removed");

        self.detach(id, child);
        self.mark_dirty(id);
        self.emit(id);
        self.settle()
    }

    /// Merge `patch` into a node's state, publishing one `StateChange` per
    /// key that actually changed.
    pub fn set_state(&mut self, id: NodeId, patch: Map<String, Value>) -> Result<()> {
        self.node_ref(id)?;
        for (key, value) in patch {
            self.update_state(id, &key, value);
        }
        Ok(())
    }

    pub fn subscribe<F>(&mut self, id: NodeId, listener: F) -> Result<SubscriberId>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FormError::NodeNotFound(id.to_string()))?;
        Ok(node.bus.subscribe(listener))
    }

    /// Returns `false` when the node or the subscription is gone.
    pub fn unsubscribe(&mut self, id: NodeId, subscriber: SubscriberId) -> bool {
        self.nodes
            .get_mut(&id)
            .map(|node| node.bus.unsubscribe(subscriber))
            .unwrap_or(false)
    }

    pub(crate) fn update_state(&mut self, id: NodeId, key: &str, value: Value) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if node.state.get(key) == Some(&value) {
            return false;
        }
        node.state.insert(key.to_string(), value.clone());
        node.bus.publish(&ChangeEvent::StateChange {
            key: key.to_string(),
            value,
        });
        true
    }

    /// Flush computed fields, then report a root change once.
    ///
    /// A flush cut off by the loop guard keeps what it already applied; that
    /// value is still reported before the error is returned, so no change
    /// carries over into the next write.
    fn settle(&mut self) -> Result<()> {
        let flushed = self.flush();
        if std::mem::take(&mut self.root_changed) {
            if let Some(sink) = &self.sink {
                sink(&self.value());
            }
            if self.options.validate_on_change {
                self.queue_validation(false);
            }
        }
        flushed
    }

    fn build(
        &mut self,
        parent: Option<NodeId>,
        name: String,
        schema: Arc<EffectiveSchema>,
        value: Option<Value>,
    ) -> Result<NodeId> {
        let (path, depth) = match parent {
            Some(parent) => {
                let parent = self.node_ref(parent)?;
                (join_pointer(&parent.path, &name), parent.depth + 1)
            }
            None => (String::new(), 0),
        };

        let mut node = FormNode::new(parent, name, path, depth, Arc::clone(&schema));
        let id = node.id;
        let value = value.or_else(|| schema.default_value().cloned());
        if let NodeKind::Leaf = node.kind {
            node.default_value = coerce(schema.kind(), schema.default_value().cloned());
            node.value = coerce(schema.kind(), value.clone());
        } else {
            node.default_value = schema.default_value().cloned();
        }
        self.nodes.insert(id, node);

        match schema.kind() {
            SchemaKind::Object => self.build_object(id, &schema, value)?,
            SchemaKind::Array => self.build_array(id, &schema, value)?,
            _ => {}
        }

        self.register(id)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.ready = true;
        }
        Ok(id)
    }

    fn build_object(
        &mut self,
        id: NodeId,
        schema: &EffectiveSchema,
        value: Option<Value>,
    ) -> Result<()> {
        let incoming = match value {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        for (name, child_schema) in schema.properties() {
            let child = self.build(
                Some(id),
                name.clone(),
                Arc::clone(child_schema),
                incoming.get(name).cloned(),
            )?;
            let child_value = self.nodes.get(&child).and_then(|n| n.value.clone());
            if let Some(state) = self.object_state(id) {
                state.children.insert(name.clone(), child);
                if let Some(child_value) = child_value {
                    state.draft.insert(name.clone(), child_value);
                }
            }
        }

        if schema.additional_properties_allowed() {
            let extras = undeclared(schema, &incoming);
            if let Some(state) = self.object_state(id) {
                state.extras = extras;
            }
        }

        for (name, field) in schema.virtual_fields() {
            self.build_virtual(id, name, field)?;
        }

        let composed = self.compose(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.value = composed;
        }
        Ok(())
    }

    fn build_array(
        &mut self,
        id: NodeId,
        schema: &EffectiveSchema,
        value: Option<Value>,
    ) -> Result<()> {
        let elements = match value {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        match schema.items() {
            Some(items) => {
                for element in elements {
                    self.build_element(id, Arc::clone(items), Some(element))?;
                }
                let min = schema.min_items().unwrap_or(0);
                while self.array_len(id) < min {
                    self.build_element(id, Arc::clone(items), None)?;
                }
                let composed = self.compose(id);
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.value = composed;
                }
            }
            // Without `items` the array is held as an opaque value.
            None => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.value = Some(Value::Array(elements));
                }
            }
        }
        Ok(())
    }

    fn build_element(
        &mut self,
        array: NodeId,
        items: Arc<EffectiveSchema>,
        value: Option<Value>,
    ) -> Result<NodeId> {
        let name = self.array_len(array).to_string();
        let child = self.build(Some(array), name, items, value)?;
        if let Some(NodeKind::Array(state)) = self.nodes.get_mut(&array).map(|n| &mut n.kind) {
            state.children.push(child);
        }
        Ok(child)
    }

    fn build_virtual(&mut self, object: NodeId, name: &str, field: &VirtualField) -> Result<()> {
        let (path, depth, references) = {
            let parent = self.node_ref(object)?;
            let references: Vec<NodeId> = field
                .fields
                .iter()
                .filter_map(|field| parent.child(field))
                .collect();
            (join_pointer(&parent.path, name), parent.depth + 1, references)
        };

        let mut node = FormNode::new(
            Some(object),
            name.to_string(),
            path,
            depth,
            Arc::clone(&field.schema),
        );
        let id = node.id;
        node.kind = NodeKind::Virtual(VirtualState {
            references: references.clone(),
        });
        self.nodes.insert(id, node);

        for reference in references {
            self.virtual_links.entry(reference).or_default().push(id);
        }
        if let Some(state) = self.object_state(object) {
            state.children.insert(name.to_string(), id);
        }

        let composed = self.compose(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.value = composed;
        }
        self.register(id)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.ready = true;
        }
        Ok(())
    }

    fn object_state(&mut self, id: NodeId) -> Option<&mut ObjectState> {
        match self.nodes.get_mut(&id).map(|n| &mut n.kind) {
            Some(NodeKind::Object(state)) => Some(state),
            _ => None,
        }
    }

    fn array_len(&self, id: NodeId) -> usize {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::Array(state)) => state.children.len(),
            _ => 0,
        }
    }

    /// The aggregate value of a node from its current parts.
    fn compose(&self, id: NodeId) -> Option<Value> {
        let node = self.nodes.get(&id)?;
        let value_of = |child: &NodeId| {
            self.nodes
                .get(child)
                .and_then(|n| n.value.clone())
                .unwrap_or(Value::Null)
        };
        match &node.kind {
            // Declared order, never insertion order.
            NodeKind::Object(state) => {
                let mut out = Map::new();
                for name in state.children.keys() {
                    if let Some(value) = state.draft.get(name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                for (key, value) in &state.extras {
                    out.insert(key.clone(), value.clone());
                }
                Some(Value::Object(out))
            }
            NodeKind::Array(state) if node.schema.items().is_some() => {
                Some(Value::Array(state.children.iter().map(value_of).collect()))
            }
            NodeKind::Virtual(state) => {
                Some(Value::Array(state.references.iter().map(value_of).collect()))
            }
            NodeKind::Array(_) | NodeKind::Leaf => node.value.clone(),
        }
    }

    /// Write `value` into a node and propagate.
    pub(crate) fn write_value(&mut self, id: NodeId, value: Option<Value>) -> Result<()> {
        let node = self.node_ref(id)?;
        match &node.kind {
            NodeKind::Leaf => {
                let coerced = coerce(node.schema.kind(), value);
                if node.value == coerced {
                    return Ok(());
                }
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.value = coerced;
                }
                self.value_changed(id);
                Ok(())
            }
            NodeKind::Object(_) => self.write_object(id, value),
            NodeKind::Array(_) => self.write_array(id, value),
            NodeKind::Virtual(_) => self.write_virtual(id, value),
        }
    }

    fn write_object(&mut self, id: NodeId, value: Option<Value>) -> Result<()> {
        let node = self.node_ref(id)?;
        let NodeKind::Object(state) = &node.kind else {
            return Ok(());
        };
        let schema = Arc::clone(&node.schema);
        let children: Vec<(String, NodeId)> = schema
            .properties()
            .keys()
            .filter_map(|name| state.children.get(name).map(|child| (name.clone(), *child)))
            .collect();
        let virtuals: Vec<NodeId> = schema
            .virtual_fields()
            .keys()
            .filter_map(|name| state.children.get(name).copied())
            .collect();
        let previous_extras = state.extras.clone();

        let incoming = match value {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        self.begin_bulk(id);
        let result = self.write_children(&children, &incoming);
        let extras = if schema.additional_properties_allowed() {
            undeclared(&schema, &incoming)
        } else {
            Map::new()
        };
        if extras != previous_extras {
            if let Some(state) = self.object_state(id) {
                state.extras = extras;
            }
            self.mark_dirty(id);
        }
        self.end_bulk(id);
        result?;

        for virtual_node in virtuals {
            self.emit(virtual_node);
        }
        self.emit(id);
        Ok(())
    }

    fn write_children(
        &mut self,
        children: &[(String, NodeId)],
        incoming: &Map<String, Value>,
    ) -> Result<()> {
        for (name, child) in children {
            self.write_value(*child, incoming.get(name).cloned())?;
        }
        Ok(())
    }

    fn write_array(&mut self, id: NodeId, value: Option<Value>) -> Result<()> {
        let node = self.node_ref(id)?;
        let NodeKind::Array(state) = &node.kind else {
            return Ok(());
        };

        let Some(items) = node.schema.items().cloned() else {
            let value = match value {
                Some(Value::Array(items)) => Value::Array(items),
                _ => Value::Array(Vec::new()),
            };
            if node.value.as_ref() == Some(&value) {
                return Ok(());
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.value = Some(value);
            }
            self.value_changed(id);
            return Ok(());
        };

        let existing = state.children.clone();
        let incoming = match value {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        self.begin_bulk(id);
        let result = self.reconcile_array(id, &existing, incoming, &items);
        self.end_bulk(id);
        result?;
        self.emit(id);
        Ok(())
    }

    /// Rewrite kept elements in place, build new ones, drop the surplus.
    fn reconcile_array(
        &mut self,
        id: NodeId,
        existing: &[NodeId],
        incoming: Vec<Value>,
        items: &Arc<EffectiveSchema>,
    ) -> Result<()> {
        let len = incoming.len();
        for (index, element) in incoming.into_iter().enumerate() {
            match existing.get(index) {
                Some(child) => self.write_value(*child, Some(element))?,
                None => {
                    let child = self.build_element(id, Arc::clone(items), Some(element))?;
                    self.mark_dirty(child);
                }
            }
        }
        if existing.len() > len {
            for child in existing[len..].iter().rev() {
                self.detach(id, *child);
            }
            self.mark_dirty(id);
        }
        Ok(())
    }

    fn write_virtual(&mut self, id: NodeId, value: Option<Value>) -> Result<()> {
        let node = self.node_ref(id)?;
        let NodeKind::Virtual(state) = &node.kind else {
            return Ok(());
        };
        let references = state.references.clone();

        let slots: Vec<Option<Value>> = match value {
            None => vec![None; references.len()],
            Some(Value::Array(items)) if items.len() == references.len() => {
                items.into_iter().map(Some).collect()
            }
            Some(other) => {
                return Err(FormError::InvalidVirtualNodeValues {
                    path: node.path.clone(),
                    expected: references.len(),
                    preview: preview(&other),
                })
            }
        };

        self.begin_bulk(id);
        let mut result = Ok(());
        for (reference, slot) in references.iter().zip(slots) {
            let current = self.nodes.get(reference).and_then(|n| n.value.clone());
            if current == slot {
                continue;
            }
            if let Err(err) = self.write_value(*reference, slot) {
                result = Err(err);
                break;
            }
        }
        self.end_bulk(id);
        result?;
        self.emit(id);
        Ok(())
    }

    fn begin_bulk(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.suppress += 1;
        }
    }

    fn end_bulk(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.suppress = node.suppress.saturating_sub(1);
        }
    }

    fn mark_dirty(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get(&id) {
            self.dirty.push(split_pointer(&node.path));
        }
    }

    /// A node's value changed: publish, then notify whatever depends on it.
    fn value_changed(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        trace!(path = %node.path, "value changed");
        node.bus.publish(&ChangeEvent::Change {
            value: node.value.clone(),
        });

        let parent = node.parent;
        let is_virtual = matches!(node.kind, NodeKind::Virtual(_));
        let is_composite = match &node.kind {
            NodeKind::Object(_) => true,
            NodeKind::Array(_) => node.schema.items().is_some(),
            NodeKind::Virtual(_) | NodeKind::Leaf => false,
        };

        // Composite changes are covered by the paths of the parts that changed.
        if !is_composite {
            self.mark_dirty(id);
        }

        if let Some(virtuals) = self.virtual_links.get(&id).cloned() {
            for virtual_node in virtuals {
                self.recompose_virtual(virtual_node);
            }
        }

        // Virtual nodes hold no storage in their parent.
        if is_virtual {
            return;
        }
        match parent {
            Some(parent) => self.child_changed(parent, id),
            None => self.root_changed = true,
        }
    }

    fn child_changed(&mut self, parent: NodeId, child: NodeId) {
        let Some((name, value)) = self
            .nodes
            .get(&child)
            .map(|c| (c.name.clone(), c.value.clone()))
        else {
            return;
        };
        let Some(node) = self.nodes.get_mut(&parent) else {
            return;
        };
        if let NodeKind::Object(state) = &mut node.kind {
            match value {
                Some(value) => {
                    state.draft.insert(name, value);
                }
                None => {
                    state.draft.shift_remove(&name);
                }
            }
        }
        if node.ready && node.suppress == 0 {
            self.emit(parent);
        }
    }

    fn recompose_virtual(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let parent_busy = node
            .parent
            .and_then(|p| self.nodes.get(&p))
            .map(|p| p.suppress > 0)
            .unwrap_or(false);
        if !node.ready || node.suppress > 0 || parent_busy {
            return;
        }
        self.emit(id);
    }

    /// Recompute the aggregate and propagate if it differs from the last one.
    fn emit(&mut self, id: NodeId) {
        let composed = self.compose(id);
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.value == composed {
            return;
        }
        node.value = composed;
        self.value_changed(id);
    }

    /// Drop an array element and renumber the elements after it.
    fn detach(&mut self, array: NodeId, child: NodeId) {
        let position = match self.nodes.get_mut(&array).map(|n| &mut n.kind) {
            Some(NodeKind::Array(state)) => {
                let Some(position) = state.children.iter().position(|c| *c == child) else {
                    return;
                };
                state.children.remove(position);
                position
            }
            _ => return,
        };
        self.drop_subtree(child);
        self.renumber(array, position);
    }

    fn drop_subtree(&mut self, id: NodeId) {
        let removed: BTreeSet<NodeId> = self.subtree(id).into_iter().collect();
        let outside = self.ancestors(id);
        self.unregister(&removed);
        for node in &removed {
            self.virtual_links.remove(node);
            self.retract_errors(*node, &outside);
        }
        for links in self.virtual_links.values_mut() {
            links.retain(|v| !removed.contains(v));
        }
        // Dropping a node drops its bus, and with it every listener.
        for node in removed {
            self.nodes.remove(&node);
        }
    }

    fn renumber(&mut self, array: NodeId, from: usize) {
        let (children, array_path) = match self.nodes.get(&array) {
            Some(node) => match &node.kind {
                NodeKind::Array(state) => (state.children.clone(), node.path.clone()),
                _ => return,
            },
            None => return,
        };
        let mut moved = BTreeSet::new();
        for (index, child) in children.iter().enumerate().skip(from) {
            let name = index.to_string();
            if let Some(node) = self.nodes.get_mut(child) {
                node.name = name.clone();
            }
            self.repath(*child, join_pointer(&array_path, &name), &mut moved);
        }

        // Pointers were bound against the old paths.
        self.unregister(&moved);
        for id in moved {
            if let Err(err) = self.register(id) {
                debug!(error = %err, "expression rebinding failed after renumbering");
            }
        }
    }

    fn repath(&mut self, id: NodeId, path: String, moved: &mut BTreeSet<NodeId>) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.path == path {
            return;
        }
        let previous = std::mem::replace(&mut node.path, path.clone());
        node.bus.publish(&ChangeEvent::PathChange {
            previous,
            current: path.clone(),
        });
        let children: Vec<(NodeId, String)> = node
            .children()
            .into_iter()
            .filter_map(|c| self.nodes.get(&c).map(|n| (c, n.name.clone())))
            .collect();
        moved.insert(id);
        for (child, name) in children {
            self.repath(child, join_pointer(&path, &name), moved);
        }
    }
}

impl fmt::Debug for FormTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormTree")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Keys of `incoming` the schema does not declare.
fn undeclared(schema: &EffectiveSchema, incoming: &Map<String, Value>) -> Map<String, Value> {
    incoming
        .iter()
        .filter(|(key, _)| schema.property(key).is_none())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn options() -> FormOptions {
        FormOptions {
            validate_on_init: false,
            ..FormOptions::default()
        }
    }

    fn tree(schema: Value, value: Option<Value>) -> FormTree {
        FormTree::new(&schema, value, options()).unwrap()
    }

    fn changes(tree: &mut FormTree, path: &str) -> Arc<Mutex<Vec<Option<Value>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = tree.find(path).unwrap();
        tree.subscribe(id, move |event| {
            if let ChangeEvent::Change { value } = event {
                sink.lock().push(value.clone());
            }
        })
        .unwrap();
        seen
    }

    #[test]
    fn object_value_follows_declared_order() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "b": { "type": "string" },
                    "a": { "type": "string" }
                }
            }),
            None,
        );
        tree.set_value_at("/a", Some(json!("first"))).unwrap();
        tree.set_value_at("/b", Some(json!("second"))).unwrap();

        let keys: Vec<String> = tree.value().as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn wholesale_write_emits_once_and_drops_stale_keys() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "string" },
                    "b": { "type": "number" }
                }
            }),
            Some(json!({ "a": "x", "b": 1, "extra": true })),
        );
        let root = changes(&mut tree, "");

        tree.set_value(tree.root(), Some(json!({ "a": "y", "b": 2 })))
            .unwrap();
        assert_eq!(root.lock().len(), 1);
        assert_eq!(tree.value(), json!({ "a": "y", "b": 2 }));
    }

    #[test]
    fn closed_objects_discard_undeclared_keys() {
        let tree = tree(
            json!({
                "type": "object",
                "properties": { "a": { "type": "string" } },
                "additionalProperties": false
            }),
            Some(json!({ "a": "x", "other": 1 })),
        );
        assert_eq!(tree.value(), json!({ "a": "x" }));
    }

    #[test]
    fn leaf_defaults_apply_only_without_explicit_value() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": { "n": { "type": "integer", "default": 5 } }
            }),
            None,
        );
        assert_eq!(tree.value(), json!({ "n": 5 }));

        tree.set_value_at("/n", None).unwrap();
        assert_eq!(tree.value(), json!({}));
        let n = tree.find("/n").unwrap();
        assert_eq!(tree.node(n).unwrap().default_value(), Some(&json!(5)));
    }

    #[test]
    fn unchanged_writes_do_not_emit() {
        let mut tree = tree(
            json!({ "type": "object", "properties": { "a": { "type": "number" } } }),
            Some(json!({ "a": 1 })),
        );
        let root = changes(&mut tree, "");
        tree.set_value_at("/a", Some(json!(1))).unwrap();
        tree.set_value_at("/a", Some(json!("1"))).unwrap();
        assert!(root.lock().is_empty());
    }

    #[test]
    fn removal_renumbers_and_republishes_paths() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "items": { "type": "array", "items": { "type": "string" } }
                }
            }),
            Some(json!({ "items": ["a", "b", "c"] })),
        );
        let items = tree.find("/items").unwrap();
        let last = tree.find("/items/2").unwrap();

        let moves = Arc::new(Mutex::new(Vec::new()));
        {
            let moves = Arc::clone(&moves);
            tree.subscribe(last, move |event| {
                if let ChangeEvent::PathChange { previous, current } = event {
                    moves.lock().push((previous.clone(), current.clone()));
                }
            })
            .unwrap();
        }

        tree.remove(items, 0).unwrap();
        assert_eq!(tree.value(), json!({ "items": ["b", "c"] }));
        assert_eq!(tree.find("/items/1"), Some(last));
        assert_eq!(tree.node(last).unwrap().name(), "1");
        assert_eq!(
            *moves.lock(),
            vec![("/items/2".to_string(), "/items/1".to_string())]
        );
        assert!(tree.find("/items/2").is_none());
    }

    #[test]
    fn wholesale_array_write_reconciles_children() {
        let mut tree = tree(
            json!({ "type": "array", "items": { "type": "number" } }),
            Some(json!([1, 2, 3])),
        );
        let first = tree.find("/0").unwrap();
        tree.set_value(tree.root(), Some(json!([7]))).unwrap();
        assert_eq!(tree.value(), json!([7]));
        assert_eq!(tree.find("/0"), Some(first));
        assert_eq!(tree.children(tree.root()).len(), 1);

        tree.set_value(tree.root(), Some(json!([7, 8]))).unwrap();
        assert_eq!(tree.value(), json!([7, 8]));
    }

    #[test]
    fn unsupported_operations_are_reported() {
        let mut tree = tree(
            json!({ "type": "object", "properties": { "a": { "type": "string" } } }),
            None,
        );
        let a = tree.find("/a").unwrap();
        let err = tree.push(a, None).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_OPERATION");
        assert_eq!(tree.remove(a, 0).unwrap_err().code(), "UNSUPPORTED_OPERATION");
        assert_eq!(
            tree.set_value_at("/missing", None).unwrap_err().code(),
            "NODE_NOT_FOUND"
        );
    }

    #[test]
    fn change_sink_sees_each_settled_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut tree = tree(
            json!({ "type": "object", "properties": { "a": { "type": "string" } } }),
            None,
        )
        .with_change_sink(move |value| sink.lock().push(value.clone()));

        tree.set_value_at("/a", Some(json!("x"))).unwrap();
        tree.set_value_at("/a", Some(json!("x"))).unwrap();
        assert_eq!(*seen.lock(), vec![json!({ "a": "x" })]);
    }

    #[test]
    fn a_cut_off_flush_reports_its_change_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "on": { "type": "boolean" },
                    "a": { "type": "number", "&value": "../on && (../b || 0) + 1" },
                    "b": { "type": "number", "&value": "../on && (../a || 0) + 1" },
                    "note": { "type": "string" }
                }
            }),
            None,
        )
        .with_change_sink(move |value| sink.lock().push(value.clone()));
        tree.take_validation_requests();

        let err = tree.set_value_at("/on", Some(json!(true))).unwrap_err();
        assert_eq!(err.code(), "INFINITE_LOOP_DETECTED");
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(tree.take_validation_requests().len(), 1);

        tree.set_value_at("/note", Some(json!("x"))).unwrap();
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[1]["note"], json!("x"));
        assert_eq!(tree.take_validation_requests().len(), 1);
    }

    #[test]
    fn state_patches_publish_per_changed_key() {
        let mut tree = tree(
            json!({ "type": "object", "properties": { "a": { "type": "string" } } }),
            None,
        );
        let a = tree.find("/a").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            tree.subscribe(a, move |event| {
                if let ChangeEvent::StateChange { key, .. } = event {
                    seen.lock().push(key.clone());
                }
            })
            .unwrap();
        }

        let mut patch = Map::new();
        patch.insert("focused".into(), json!(true));
        patch.insert("visible".into(), json!(true));
        tree.set_state(a, patch).unwrap();
        assert_eq!(*seen.lock(), vec!["focused".to_string()]);
        assert_eq!(tree.node(a).unwrap().state()["focused"], json!(true));
    }
}
