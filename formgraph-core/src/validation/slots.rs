//! Own / Received Error Slots

use indexmap::IndexMap;

use super::ValidationError;
use crate::graph::NodeId;

/// Errors held by one node.
///
/// `own` errors belong to the node's value. `received` errors bubbled up
/// from descendants and are keyed by the descendant that reported them, so
/// a descendant's later success removes exactly its contribution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorSlots {
    own: Vec<ValidationError>,
    received: IndexMap<NodeId, Vec<ValidationError>>,
}

impl ErrorSlots {
    pub fn own(&self) -> &[ValidationError] {
        &self.own
    }

    pub fn received(&self) -> impl Iterator<Item = &ValidationError> {
        self.received.values().flatten()
    }

    /// Own errors followed by received errors in arrival order.
    pub fn merged(&self) -> Vec<ValidationError> {
        self.own.iter().chain(self.received()).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.own.is_empty() && self.received.is_empty()
    }

    pub(crate) fn set_own(&mut self, errors: Vec<ValidationError>) {
        self.own = errors;
    }

    /// Replace what `from` contributed. An empty list retracts it.
    pub(crate) fn receive(&mut self, from: NodeId, errors: Vec<ValidationError>) {
        if errors.is_empty() {
            self.received.shift_remove(&from);
        } else {
            self.received.insert(from, errors);
        }
    }

    pub(crate) fn retract(&mut self, from: NodeId) -> bool {
        self.received.shift_remove(&from).is_some()
    }

    /// Drop own and received errors carrying `key`.
    pub(crate) fn retract_key(&mut self, key: &str) -> bool {
        let before = self.own.len() + self.received().count();
        self.own.retain(|e| e.key.as_deref() != Some(key));
        for errors in self.received.values_mut() {
            errors.retain(|e| e.key.as_deref() != Some(key));
        }
        self.received.retain(|_, errors| !errors.is_empty());
        before != self.own.len() + self.received().count()
    }
}
