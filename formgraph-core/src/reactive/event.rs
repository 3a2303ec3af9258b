//! Change Events
//!
//! The messages a node publishes to its listeners. Events are transient:
//! they are delivered synchronously and never stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validation::ValidationError;

/// Tag of a [`ChangeEvent`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    PathChange,
    StateChange,
    Validate,
}

/// An event published by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeEvent {
    /// The node's value changed. `None` is undefined.
    Change { value: Option<Value> },

    /// The node moved, e.g. after an earlier array element was removed.
    PathChange { previous: String, current: String },

    /// One state flag changed.
    StateChange { key: String, value: Value },

    /// The node's merged errors changed.
    Validate { errors: Vec<ValidationError> },
}

impl ChangeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Change { .. } => EventKind::Change,
            Self::PathChange { .. } => EventKind::PathChange,
            Self::StateChange { .. } => EventKind::StateChange,
            Self::Validate { .. } => EventKind::Validate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let event = ChangeEvent::PathChange {
            previous: "/items/2".into(),
            current: "/items/1".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "pathChange", "previous": "/items/2", "current": "/items/1" })
        );
        assert_eq!(event.kind(), EventKind::PathChange);
    }
}
