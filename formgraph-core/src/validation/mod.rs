//! Validation
//!
//! The form core never validates values itself. A [`Validator`] capability
//! is injected by whoever builds the form; it receives the full root value
//! and the effective root schema and returns flat, path-tagged errors.
//!
//! The tree turns every settled root change into a [`ValidationRequest`].
//! Whoever drives the tree runs the validator for each request and hands the
//! result back through `FormTree::apply_validation`, which routes each error
//! to the node owning its `dataPath`.
//!
//! Each node keeps its own errors apart from the errors received from
//! descendants ([`ErrorSlots`]), so either side can be cleared without
//! touching the other.

mod distributor;
mod schema_validator;
mod slots;

use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) use distributor::DistributorState;
pub use schema_validator::JsonSchemaValidator;
pub use slots::ErrorSlots;

/// One failed constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// JSON pointer of the offending value, `""` for the root.
    pub data_path: String,
    pub message: String,
    /// The schema keyword that failed, e.g. `required` or `minLength`.
    pub keyword: String,
    /// Stable identity used to retract this error later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ValidationError {
    pub fn new(
        data_path: impl Into<String>,
        keyword: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            message: message.into(),
            keyword: keyword.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// The injected validation capability.
pub trait Validator: Send + Sync {
    /// Validate `value` against `schema`. An empty list means valid.
    fn validate<'a>(&'a self, value: &'a Value, schema: &'a Value)
        -> BoxFuture<'a, Vec<ValidationError>>;
}

/// Synchronous closures are validators that resolve immediately.
impl<F> Validator for F
where
    F: Fn(&Value, &Value) -> Vec<ValidationError> + Send + Sync,
{
    fn validate<'a>(
        &'a self,
        value: &'a Value,
        schema: &'a Value,
    ) -> BoxFuture<'a, Vec<ValidationError>> {
        future::ready(self(value, schema)).boxed()
    }
}

/// A validation pass waiting to be run.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Increases with every request of a tree.
    pub generation: u64,
    /// Snapshot of the root value to validate.
    pub value: Value,
    pub schema: Arc<Value>,
    /// Run on the next tick instead of immediately. Set for the first pass
    /// after construction.
    pub deferred: bool,
}
