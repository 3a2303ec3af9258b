//! Dependency Tracking
//!
//! Every compiled expression of a node (computed flags, derived value,
//! watch list, composition predicates) is bound to absolute path patterns
//! when the node is built. The bindings live in a [`DependencyIndex`] on the
//! nearest object ancestor; a change at any path overlapping a pattern
//! schedules the expression.
//!
//! # Flushing
//!
//! Writes only record dirty paths. [`FormTree::flush`] then runs batches:
//!
//! 1. collect the expressions whose patterns overlap a dirty path;
//! 2. order them so that derived values are written before they are read;
//! 3. evaluate them, which may dirty more paths for the next batch.
//!
//! Derived values feeding each other without settling are cut off after
//! `max_feedback_batches` batches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::error::{FormError, Result, SchemaError};
use crate::expr::{split_pointer, truthy, CompiledExpr, PathPattern, RelativePointer, Segment};
use crate::graph::{FormTree, NodeId, NodeKind, UpdateScheduler};
use crate::schema::EffectiveSchema;

/// Which expression of a node a binding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExprSlot {
    Visible,
    ReadOnly,
    Disabled,
    Value,
    Watch,
    /// Predicate of the object's n-th composition branch.
    Branch(usize),
}

/// One expression of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprRef {
    pub owner: NodeId,
    pub slot: ExprSlot,
}

/// Path patterns watched by expressions.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    entries: BTreeMap<PathPattern, SmallVec<[ExprRef; 2]>>,
}

impl DependencyIndex {
    pub fn insert(&mut self, pattern: PathPattern, target: ExprRef) {
        let targets = self.entries.entry(pattern).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    /// Drop every binding of the expressions owned by `owners`.
    pub fn remove_owners(&mut self, owners: &BTreeSet<NodeId>) {
        for targets in self.entries.values_mut() {
            targets.retain(|t| !owners.contains(&t.owner));
        }
        self.entries.retain(|_, targets| !targets.is_empty());
    }

    /// Expressions affected by a change at `path`.
    pub fn affected<'a>(&'a self, path: &'a [String]) -> impl Iterator<Item = ExprRef> + 'a {
        self.entries
            .iter()
            .filter(move |(pattern, _)| pattern.overlaps(path))
            .flat_map(|(_, targets)| targets.iter().copied())
    }

    /// Number of watched patterns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expressions of a schema with the pointers they read.
fn expressions(schema: &EffectiveSchema) -> Vec<(ExprSlot, &[RelativePointer])> {
    let computed = schema.computed();
    let mut out = Vec::new();
    let fields = [
        (ExprSlot::Visible, &computed.visible),
        (ExprSlot::ReadOnly, &computed.read_only),
        (ExprSlot::Disabled, &computed.disabled),
        (ExprSlot::Value, &computed.value),
    ];
    for (slot, expr) in fields {
        if let Some(expr) = expr {
            out.push((slot, expr.dependencies()));
        }
    }
    if !computed.watch.is_empty() {
        out.push((ExprSlot::Watch, computed.watch.as_slice()));
    }
    for (index, branch) in schema.branches().iter().enumerate() {
        if let Some(predicate) = &branch.predicate {
            out.push((ExprSlot::Branch(index), predicate.dependencies()));
        }
    }
    out
}

fn expression_for(schema: &EffectiveSchema, slot: ExprSlot) -> Option<&CompiledExpr> {
    let computed = schema.computed();
    match slot {
        ExprSlot::Visible => computed.visible.as_ref(),
        ExprSlot::ReadOnly => computed.read_only.as_ref(),
        ExprSlot::Disabled => computed.disabled.as_ref(),
        ExprSlot::Value => computed.value.as_ref(),
        ExprSlot::Watch => None,
        ExprSlot::Branch(index) => schema.branches().get(index)?.predicate.as_ref(),
    }
}

/// Collect every value matched by a wildcard pattern.
fn collect(value: &Value, segments: &[Segment], out: &mut Vec<Value>) {
    let Some((first, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };
    match first {
        Segment::Key(key) => {
            let child = match value {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            if let Some(child) = child {
                collect(child, rest, out);
            }
        }
        Segment::Wildcard => match value {
            Value::Object(map) => map.values().for_each(|v| collect(v, rest, out)),
            Value::Array(items) => items.iter().for_each(|v| collect(v, rest, out)),
            _ => {}
        },
    }
}

impl FormTree {
    /// Node whose index holds the bindings of `slot` on `id`.
    ///
    /// Field expressions live on the nearest object ancestor, composition
    /// predicates on the object itself.
    fn host_of(&self, id: NodeId, slot: ExprSlot) -> NodeId {
        if let ExprSlot::Branch(_) = slot {
            return id;
        }
        self.ancestors(id)
            .into_iter()
            .find(|a| matches!(self.nodes.get(a).map(|n| &n.kind), Some(NodeKind::Object(_))))
            .unwrap_or(id)
    }

    fn patterns_of(&self, target: ExprRef) -> Vec<PathPattern> {
        let Some(node) = self.nodes.get(&target.owner) else {
            return Vec::new();
        };
        let base = split_pointer(&node.path);
        expressions(&node.schema)
            .into_iter()
            .filter(|(slot, _)| *slot == target.slot)
            .flat_map(|(_, pointers)| pointers.iter().filter_map(|p| p.resolve(&base)))
            .collect()
    }

    /// Bind every expression of `id` and schedule it for evaluation.
    pub(crate) fn register(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_ref(id)?;
        let schema = Arc::clone(&node.schema);
        let base = split_pointer(&node.path);

        let mut bindings = Vec::new();
        for (slot, pointers) in expressions(&schema) {
            let mut patterns = Vec::with_capacity(pointers.len());
            for pointer in pointers {
                let pattern =
                    pointer
                        .resolve(&base)
                        .ok_or_else(|| SchemaError::ConditionCompile {
                            path: node.path.clone(),
                            expression: pointer.source().to_string(),
                            reason: "pointer climbs above the root".to_string(),
                        })?;
                patterns.push(pattern);
            }
            bindings.push((ExprRef { owner: id, slot }, patterns));
        }

        for (target, patterns) in bindings {
            let host = self.host_of(id, target.slot);
            if !patterns.is_empty() {
                if let Some(host_node) = self.nodes.get_mut(&host) {
                    for pattern in patterns {
                        host_node.index.insert(pattern, target);
                    }
                    self.hosts.insert(host);
                }
            }
            self.pending.insert(target);
        }
        Ok(())
    }

    /// Drop every binding of the expressions owned by `owners`.
    ///
    /// A host stays registered while its index still binds other owners.
    pub(crate) fn unregister(&mut self, owners: &BTreeSet<NodeId>) {
        let hosts: Vec<NodeId> = self.hosts.iter().copied().collect();
        for host in hosts {
            let empty = match self.nodes.get_mut(&host) {
                Some(node) => {
                    node.index.remove_owners(owners);
                    node.index.is_empty()
                }
                None => true,
            };
            if empty {
                self.hosts.remove(&host);
            }
        }
        self.pending.retain(|target| !owners.contains(&target.owner));
    }

    /// Evaluate affected expressions until no path is dirty.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let mut batches = 0;
        loop {
            let dirty = std::mem::take(&mut self.dirty);
            let mut affected = std::mem::take(&mut self.pending);
            for host in &self.hosts {
                if let Some(node) = self.nodes.get(host) {
                    for path in &dirty {
                        affected.extend(node.index.affected(path));
                    }
                }
            }
            affected.retain(|target| self.nodes.contains_key(&target.owner));
            if affected.is_empty() {
                return Ok(());
            }

            batches += 1;
            if batches > self.options.max_feedback_batches {
                return Err(self.loop_detected(&affected, batches - 1));
            }
            trace!(batch = batches, expressions = affected.len(), "feedback batch");

            for target in self.schedule(&affected) {
                if let Err(err) = self.evaluate(target) {
                    self.dirty.clear();
                    self.pending.clear();
                    return Err(err);
                }
            }
        }
    }

    fn loop_detected(&mut self, affected: &BTreeSet<ExprRef>, batches: usize) -> FormError {
        self.dirty.clear();
        self.pending.clear();

        let culprit = affected
            .iter()
            .find(|t| t.slot == ExprSlot::Value)
            .or_else(|| affected.iter().next())
            .copied();
        let (path, dependencies) = culprit
            .and_then(|target| {
                let node = self.nodes.get(&target.owner)?;
                let dependencies = expressions(&node.schema)
                    .into_iter()
                    .filter(|(slot, _)| *slot == target.slot)
                    .flat_map(|(_, pointers)| pointers.iter().map(|p| p.source().to_string()))
                    .collect();
                Some((node.path.clone(), dependencies))
            })
            .unwrap_or_default();

        warn!(path = %path, batches, "computed values did not settle");
        FormError::InfiniteLoopDetected {
            path,
            dependencies,
            batches,
        }
    }

    /// Writers of derived values run before the expressions reading them.
    fn schedule(&self, affected: &BTreeSet<ExprRef>) -> Vec<ExprRef> {
        let mut scheduler = UpdateScheduler::new();
        for target in affected {
            scheduler.add_node(*target);
        }

        let readers: Vec<(ExprRef, Vec<PathPattern>)> = affected
            .iter()
            .map(|target| (*target, self.patterns_of(*target)))
            .collect();
        for writer in affected.iter().filter(|t| t.slot == ExprSlot::Value) {
            let Some(node) = self.nodes.get(&writer.owner) else {
                continue;
            };
            let written = split_pointer(&node.path);
            for (reader, patterns) in &readers {
                if patterns.iter().any(|p| p.overlaps(&written)) {
                    scheduler.add_edge(*writer, *reader);
                }
            }
        }
        scheduler.order()
    }

    /// The value observed through a pointer bound at `base`.
    fn observe(&self, pointer: &RelativePointer, base: &[String]) -> Value {
        let Some(pattern) = pointer.resolve(base) else {
            return Value::Null;
        };
        let root = self.value();
        if pattern.segments().contains(&Segment::Wildcard) {
            let mut matches = Vec::new();
            collect(&root, pattern.segments(), &mut matches);
            return Value::Array(matches);
        }

        let path = pattern.to_string();
        if let Some(id) = self.find(&path) {
            return self
                .nodes
                .get(&id)
                .and_then(|n| n.value.clone())
                .unwrap_or(Value::Null);
        }
        root.pointer(&path).cloned().unwrap_or(Value::Null)
    }

    fn evaluate(&mut self, target: ExprRef) -> Result<()> {
        let Some(node) = self.nodes.get(&target.owner) else {
            return Ok(());
        };
        let schema = Arc::clone(&node.schema);
        let base = split_pointer(&node.path);

        if target.slot == ExprSlot::Watch {
            let values = schema
                .computed()
                .watch
                .iter()
                .map(|pointer| self.observe(pointer, &base))
                .collect();
            self.update_state(target.owner, "watchValues", Value::Array(values));
            return Ok(());
        }

        let Some(expr) = expression_for(&schema, target.slot) else {
            return Ok(());
        };
        let observed: Vec<Value> = expr
            .dependencies()
            .iter()
            .map(|pointer| self.observe(pointer, &base))
            .collect();
        let result = expr.evaluate(&observed);
        trace!(owner = %target.owner, slot = ?target.slot, expression = expr.source(), "evaluated");

        match target.slot {
            ExprSlot::Visible => {
                self.update_state(target.owner, "visible", Value::Bool(truthy(&result)));
            }
            ExprSlot::ReadOnly => {
                self.update_state(target.owner, "readOnly", Value::Bool(truthy(&result)));
            }
            ExprSlot::Disabled => {
                self.update_state(target.owner, "disabled", Value::Bool(truthy(&result)));
            }
            ExprSlot::Value => self.write_value(target.owner, Some(result))?,
            ExprSlot::Branch(index) => self.set_branch_state(target.owner, index, truthy(&result)),
            ExprSlot::Watch => {}
        }
        Ok(())
    }

    /// Record a branch activation and refresh the `active` flag of the
    /// properties it declared.
    fn set_branch_state(&mut self, object: NodeId, index: usize, active: bool) {
        let Some(node) = self.nodes.get_mut(&object) else {
            return;
        };
        let schema = Arc::clone(&node.schema);
        let NodeKind::Object(state) = &mut node.kind else {
            return;
        };
        match state.branch_states.get_mut(index) {
            Some(current) if *current != active => *current = active,
            _ => return,
        }

        let states = state.branch_states.clone();
        let children: Vec<(NodeId, bool)> = schema
            .properties()
            .iter()
            .filter(|(_, property)| !property.conditions().is_empty())
            .filter_map(|(name, property)| {
                let child = state.children.get(name)?;
                let active = property
                    .conditions()
                    .iter()
                    .any(|c| states.get(*c).copied().unwrap_or(true));
                Some((*child, active))
            })
            .collect();

        for (child, active) in children {
            self.update_state(child, "active", Value::Bool(active));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormOptions;
    use serde_json::json;

    fn tree(schema: Value, value: Option<Value>) -> Result<FormTree> {
        let options = FormOptions {
            validate_on_init: false,
            ..FormOptions::default()
        };
        FormTree::new(&schema, value, options)
    }

    #[test]
    fn index_matches_ancestors_and_descendants() {
        let mut index = DependencyIndex::default();
        let owner = NodeId::new();
        let target = ExprRef {
            owner,
            slot: ExprSlot::Visible,
        };
        let pattern = RelativePointer::parse("#/items/*/price")
            .unwrap()
            .resolve(&[])
            .unwrap();
        index.insert(pattern.clone(), target);
        index.insert(pattern, target);
        assert_eq!(index.len(), 1);

        let path = |p: &str| split_pointer(p);
        assert_eq!(index.affected(&path("/items/3/price")).count(), 1);
        assert_eq!(index.affected(&path("/items")).count(), 1);
        assert_eq!(index.affected(&path("/other")).count(), 0);

        index.remove_owners(&BTreeSet::from([owner]));
        assert!(index.is_empty());
    }

    #[test]
    fn visibility_follows_sibling() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "category": { "type": "string" },
                    "title": { "type": "string", "&visible": "../category == 'movie'" }
                }
            }),
            None,
        )
        .unwrap();
        let title = tree.find("/title").unwrap();
        assert!(!tree.is_visible(title));

        tree.set_value_at("/category", Some(json!("movie"))).unwrap();
        assert!(tree.is_visible(title));
    }

    #[test]
    fn derived_values_run_in_dependency_order() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "c": { "type": "number", "&value": "../b + 1" },
                    "b": { "type": "number", "&value": "../a * 2" },
                    "a": { "type": "number" }
                }
            }),
            Some(json!({ "a": 1 })),
        )
        .unwrap();
        assert_eq!(tree.value(), json!({ "c": 3, "b": 2, "a": 1 }));

        tree.set_value_at("/a", Some(json!(5))).unwrap();
        assert_eq!(tree.value(), json!({ "c": 11, "b": 10, "a": 5 }));
    }

    #[test]
    fn wildcard_pointers_see_every_element() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": { "price": { "type": "number" } }
                        }
                    },
                    "total": { "type": "number", "&value": "sum(#/items/*/price)" }
                }
            }),
            Some(json!({ "items": [{ "price": 1 }, { "price": 2.5 }] })),
        )
        .unwrap();
        assert_eq!(tree.value()["total"], json!(3.5));

        let items = tree.find("/items").unwrap();
        tree.push(items, Some(json!({ "price": 4 }))).unwrap();
        assert_eq!(tree.value()["total"], json!(7.5));

        tree.remove(items, 0).unwrap();
        assert_eq!(tree.value()["total"], json!(6.5));
    }

    #[test]
    fn watch_values_are_published_as_state() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "string" },
                    "b": { "type": "string", "computed": { "watch": ["../a", "#/missing"] } }
                }
            }),
            None,
        )
        .unwrap();
        tree.set_value_at("/a", Some(json!("x"))).unwrap();
        let b = tree.find("/b").unwrap();
        assert_eq!(
            tree.node(b).unwrap().state()["watchValues"],
            json!(["x", null])
        );
    }

    #[test]
    fn mutual_derivation_is_cut_off() {
        let err = tree(
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number", "&value": "(../b || 0) + 1" },
                    "b": { "type": "number", "&value": "(../a || 0) + 1" }
                }
            }),
            None,
        )
        .err()
        .unwrap();
        match err {
            FormError::InfiniteLoopDetected {
                path, dependencies, ..
            } => {
                assert!(path == "/a" || path == "/b");
                assert_eq!(dependencies.len(), 1);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn composition_predicates_toggle_properties() {
        let mut tree = tree(
            json!({
                "type": "object",
                "properties": { "kind": { "type": "string" } },
                "oneOf": [
                    { "&if": "./kind == 'a'", "properties": { "x": { "type": "string" } }, "required": ["x"] },
                    { "&if": "./kind == 'b'", "properties": { "y": { "type": "string" } } }
                ]
            }),
            Some(json!({ "kind": "a" })),
        )
        .unwrap();
        let x = tree.find("/x").unwrap();
        let y = tree.find("/y").unwrap();
        assert!(tree.is_visible(x));
        assert!(tree.is_required(x));
        assert!(!tree.is_visible(y));

        tree.set_value_at("/kind", Some(json!("b"))).unwrap();
        assert!(!tree.is_visible(x));
        assert!(!tree.is_required(x));
        assert!(tree.is_visible(y));
    }

    #[test]
    fn pointers_above_the_root_fail_at_build() {
        let err = tree(
            json!({
                "type": "object",
                "properties": { "a": { "type": "string", "&visible": "../../../x == 1" } }
            }),
            None,
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), "CONDITION_COMPILE");
    }

    fn rows(item: Value, value: Value) -> FormTree {
        tree(
            json!({
                "type": "object",
                "properties": {
                    "items": { "type": "array", "items": item }
                }
            }),
            Some(value),
        )
        .unwrap()
    }

    #[test]
    fn renumbered_elements_keep_their_derived_values() {
        let mut tree = rows(
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number", "&value": "../a * 2" }
                }
            }),
            json!({ "items": [{ "a": 1 }, { "a": 2 }] }),
        );
        assert_eq!(
            tree.value(),
            json!({ "items": [{ "a": 1, "b": 2 }, { "a": 2, "b": 4 }] })
        );

        let items = tree.find("/items").unwrap();
        tree.remove(items, 0).unwrap();
        tree.set_value_at("/items/0/a", Some(json!(5))).unwrap();
        assert_eq!(tree.value(), json!({ "items": [{ "a": 5, "b": 10 }] }));
    }

    #[test]
    fn renumbered_elements_keep_their_visibility() {
        let mut tree = rows(
            json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string" },
                    "detail": { "type": "string", "&visible": "../kind == 'other'" }
                }
            }),
            json!({ "items": [{ "kind": "a" }, { "kind": "other" }] }),
        );
        let items = tree.find("/items").unwrap();
        tree.remove(items, 0).unwrap();

        let detail = tree.find("/items/0/detail").unwrap();
        assert!(tree.is_visible(detail));
        tree.set_value_at("/items/0/kind", Some(json!("a"))).unwrap();
        assert!(!tree.is_visible(detail));
        tree.set_value_at("/items/0/kind", Some(json!("other"))).unwrap();
        assert!(tree.is_visible(detail));
    }

    #[test]
    fn dropped_elements_release_their_host() {
        let mut tree = rows(
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number", "&value": "../a + 1" }
                }
            }),
            json!({ "items": [{ "a": 1 }] }),
        );
        let element = tree.find("/items/0").unwrap();
        assert!(tree.hosts.contains(&element));

        let items = tree.find("/items").unwrap();
        tree.remove(items, 0).unwrap();
        assert!(!tree.hosts.contains(&element));
    }
}
