//! Form Options
//!
//! Tunables for a form tree. Options deserialize from camelCase JSON so they
//! can travel next to the schema document.

use serde::{Deserialize, Serialize};

use crate::error::{FormError, Result};

/// How overlapping asynchronous validation passes are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationOrdering {
    /// Only the pass started for the newest root value may be applied.
    /// Older passes that resolve later are discarded.
    #[default]
    LatestRequested,

    /// Every pass is applied when it resolves, so the last to resolve wins
    /// even if it validated an older value.
    LastResolved,
}

/// Options controlling propagation and validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FormOptions {
    /// Consecutive feedback batches allowed before a loop is reported.
    pub max_feedback_batches: usize,

    /// Queue a validation pass for every observable root change.
    pub validate_on_change: bool,

    /// Schedule a validation pass on the tick after construction.
    pub validate_on_init: bool,

    /// Reconciliation of overlapping validation passes.
    pub validation_ordering: ValidationOrdering,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            max_feedback_batches: 10,
            validate_on_change: true,
            validate_on_init: true,
            validation_ordering: ValidationOrdering::LatestRequested,
        }
    }
}

impl FormOptions {
    /// Parse options from a JSON document. Missing keys keep their defaults.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(input).map_err(|e| FormError::Config(e.to_string()))?;
        if options.max_feedback_batches == 0 {
            return Err(FormError::Config(
                "maxFeedbackBatches must be at least 1".to_string(),
            ));
        }
        Ok(options)
    }
}
