//! Error Distribution
//!
//! Routes the flat error list of a validation pass onto the tree. Each error
//! lands on the deepest existing node along its `dataPath` and is forwarded
//! to every ancestor as a received error, tagged with its origin.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json::{json, Map, Value};
use tracing::{debug, trace, warn};

use super::{ErrorSlots, ValidationError, ValidationRequest};
use crate::config::ValidationOrdering;
use crate::error::Result;
use crate::graph::{FormTree, NodeId, NodeKind};
use crate::reactive::ChangeEvent;

/// Bookkeeping of requested and applied validation passes.
#[derive(Debug, Default)]
pub(crate) struct DistributorState {
    /// Generation of the newest request.
    pub(crate) generation: u64,
    /// Nodes holding errors from the last applied pass.
    pub(crate) erroring: BTreeSet<NodeId>,
    pub(crate) requests: Vec<ValidationRequest>,
}

impl FormTree {
    /// Queue a validation pass for the current root value.
    pub fn request_validation(&mut self) -> u64 {
        self.queue_validation(false)
    }

    pub(crate) fn queue_validation(&mut self, deferred: bool) -> u64 {
        self.validation.generation += 1;
        let generation = self.validation.generation;
        self.validation.requests.push(ValidationRequest {
            generation,
            value: self.value(),
            schema: self.pass_schema(),
            deferred,
        });
        trace!(generation, deferred, "validation requested");
        generation
    }

    /// The validation schema of the next pass.
    ///
    /// Branch properties are lifted into plain `properties`, so the
    /// `required` lists of the branches active right now are layered on
    /// through `allOf`, addressed at the instance path of each object.
    pub(crate) fn pass_schema(&self) -> Arc<Value> {
        let tuple = tuple_keyword(&self.validation_schema);
        let layers: Vec<Value> = self
            .nodes
            .values()
            .filter_map(|node| {
                let NodeKind::Object(state) = &node.kind else {
                    return None;
                };
                let required: IndexSet<&str> = node
                    .schema
                    .branches()
                    .iter()
                    .zip(&state.branch_states)
                    .filter(|(_, active)| **active)
                    .flat_map(|(branch, _)| branch.required.iter().map(String::as_str))
                    .collect();
                if required.is_empty() {
                    return None;
                }
                let required: Vec<&str> = required.into_iter().collect();
                self.address(node.id, json!({ "required": required }), tuple)
            })
            .collect();
        if layers.is_empty() {
            return Arc::clone(&self.validation_schema);
        }
        trace!(layers = layers.len(), "branch requirements layered");

        let mut schema = match self.validation_schema.as_ref() {
            Value::Object(map) => map.clone(),
            Value::Bool(true) => Map::new(),
            _ => return Arc::clone(&self.validation_schema),
        };
        let all_of = schema
            .entry("allOf")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(all_of) = all_of {
            all_of.extend(layers);
        }
        Arc::new(Value::Object(schema))
    }

    /// Wrap `layer` so that it applies at the instance path of `id`.
    /// `None` below virtual nodes, which have no place in the value.
    fn address(&self, id: NodeId, mut layer: Value, tuple: &str) -> Option<Value> {
        let mut current = id;
        while let Some(node) = self.nodes.get(&current) {
            let Some(parent) = node.parent else {
                return Some(layer);
            };
            layer = match self.nodes.get(&parent).map(|p| &p.kind) {
                Some(NodeKind::Object(_)) => json!({ "properties": { node.name.clone(): layer } }),
                Some(NodeKind::Array(_)) => {
                    let index: usize = node.name.parse().ok()?;
                    let mut slots = vec![Value::Bool(true); index];
                    slots.push(layer);
                    json!({ tuple: slots })
                }
                _ => return None,
            };
            current = parent;
        }
        None
    }

    /// Hand out the queued passes. The caller runs them and reports back
    /// through [`FormTree::apply_validation`].
    pub fn take_validation_requests(&mut self) -> Vec<ValidationRequest> {
        std::mem::take(&mut self.validation.requests)
    }

    /// Generation of the newest requested pass; `0` before the first.
    pub fn latest_generation(&self) -> u64 {
        self.validation.generation
    }

    /// Apply the result of pass `generation`.
    ///
    /// Returns `false` when the pass is discarded as stale.
    pub fn apply_validation(&mut self, generation: u64, errors: Vec<ValidationError>) -> bool {
        if self.options.validation_ordering == ValidationOrdering::LatestRequested
            && generation < self.validation.generation
        {
            warn!(
                generation,
                latest = self.validation.generation,
                "discarding stale validation pass"
            );
            return false;
        }

        let mut grouped: IndexMap<NodeId, Vec<ValidationError>> = IndexMap::new();
        for error in errors {
            let target = self.nearest(&error.data_path);
            // Hidden fields do not report errors.
            if !self.is_visible(target) {
                trace!(path = %error.data_path, "error on hidden node dropped");
                continue;
            }
            grouped.entry(target).or_default().push(error);
        }

        let previous = std::mem::take(&mut self.validation.erroring);
        for id in previous {
            if !grouped.contains_key(&id) {
                self.assign_errors(id, Vec::new());
            }
        }
        for (id, errors) in grouped {
            self.assign_errors(id, errors);
            self.validation.erroring.insert(id);
        }

        debug!(
            generation,
            erroring = self.validation.erroring.len(),
            "validation applied"
        );
        true
    }

    /// Replace a node's own errors, e.g. with the result of a custom check.
    pub fn set_errors(&mut self, id: NodeId, errors: Vec<ValidationError>) -> Result<()> {
        self.node_ref(id)?;
        self.assign_errors(id, errors);
        Ok(())
    }

    /// Clear a node's own errors. Errors received from descendants stay.
    pub fn clear_errors(&mut self, id: NodeId) -> Result<()> {
        self.node_ref(id)?;
        self.assign_errors(id, Vec::new());
        self.validation.erroring.remove(&id);
        Ok(())
    }

    /// Remove the error carrying `key` from a node and its ancestors.
    pub fn remove_error(&mut self, id: NodeId, key: &str) -> Result<bool> {
        self.node_ref(id)?;
        let mut removed = false;
        for target in std::iter::once(id).chain(self.ancestors(id)) {
            removed |= self.update_errors(target, |slots| slots.retract_key(key));
        }
        Ok(removed)
    }

    /// Merged own and received errors of a node.
    pub fn errors(&self, id: NodeId) -> Vec<ValidationError> {
        self.nodes
            .get(&id)
            .map(|node| node.errors.merged())
            .unwrap_or_default()
    }

    fn assign_errors(&mut self, id: NodeId, errors: Vec<ValidationError>) {
        let ancestors = self.ancestors(id);
        self.update_errors(id, |slots| slots.set_own(errors.clone()));
        for ancestor in ancestors {
            self.update_errors(ancestor, |slots| slots.receive(id, errors.clone()));
        }
    }

    /// Drop everything `removed` forwarded to `ancestors`.
    pub(crate) fn retract_errors(&mut self, removed: NodeId, ancestors: &[NodeId]) {
        self.validation.erroring.remove(&removed);
        for ancestor in ancestors {
            self.update_errors(*ancestor, |slots| slots.retract(removed));
        }
    }

    /// Apply `f` to a node's slots and publish `Validate` if the merged list
    /// changed. Returns what `f` returned.
    fn update_errors<R>(&mut self, id: NodeId, f: impl FnOnce(&mut ErrorSlots) -> R) -> R
    where
        R: Default,
    {
        let Some(node) = self.nodes.get_mut(&id) else {
            return R::default();
        };
        let before = node.errors.clone();
        let result = f(&mut node.errors);
        if node.errors.merged() != before.merged() {
            node.bus.publish(&ChangeEvent::Validate {
                errors: node.errors.merged(),
            });
        }
        result
    }
}

/// Keyword addressing array elements by position in the schema's dialect.
fn tuple_keyword(schema: &Value) -> &'static str {
    let dialect = schema.get("$schema").and_then(Value::as_str).unwrap_or_default();
    if ["draft-04", "draft-06", "draft-07", "2019-09"]
        .iter()
        .any(|draft| dialect.contains(draft))
    {
        "items"
    } else {
        "prefixItems"
    }
}
