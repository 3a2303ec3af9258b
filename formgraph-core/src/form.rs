//! Form Handle
//!
//! [`Form`] couples a [`FormTree`] with a [`Validator`] and runs validation
//! passes on the tokio runtime. Mutations stay synchronous; every pass the
//! tree queues is spawned as its own task and applied when it resolves.
//!
//! The tree lock is never held across an await point, so listeners and
//! writers are never blocked by a slow validator.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::FormOptions;
use crate::error::{FormError, Result};
use crate::graph::{FormTree, NodeId};
use crate::validation::{ValidationError, ValidationRequest, Validator};

/// A form tree with asynchronous validation.
pub struct Form {
    tree: Arc<Mutex<FormTree>>,
    validator: Arc<dyn Validator>,
    passes: Mutex<Vec<JoinHandle<()>>>,
}

impl Form {
    /// Build a form. A pass requested at construction runs on the next tick.
    pub fn new<V>(
        schema: &Value,
        value: Option<Value>,
        validator: V,
        options: FormOptions,
    ) -> Result<Self>
    where
        V: Validator + 'static,
    {
        let tree = FormTree::new(schema, value, options)?;
        Ok(Self::from_tree(tree, Arc::new(validator)))
    }

    pub fn from_tree(tree: FormTree, validator: Arc<dyn Validator>) -> Self {
        let form = Self {
            tree: Arc::new(Mutex::new(tree)),
            validator,
            passes: Mutex::new(Vec::new()),
        };
        form.dispatch();
        form
    }

    pub fn set_value(&self, path: &str, value: Option<Value>) -> Result<()> {
        self.with_tree(|tree| tree.set_value_at(path, value))
    }

    pub fn push(&self, path: &str, value: Option<Value>) -> Result<Option<NodeId>> {
        self.with_tree(|tree| {
            let id = find(tree, path)?;
            tree.push(id, value)
        })
    }

    pub fn remove(&self, path: &str, index: usize) -> Result<()> {
        self.with_tree(|tree| {
            let id = find(tree, path)?;
            tree.remove(id, index)
        })
    }

    pub fn value(&self) -> Value {
        self.tree.lock().value()
    }

    /// Merged errors of the node at `path`; empty when there is no node.
    pub fn errors(&self, path: &str) -> Vec<ValidationError> {
        let tree = self.tree.lock();
        tree.find(path)
            .map(|id| tree.errors(id))
            .unwrap_or_default()
    }

    /// Request a pass for the current value and return its generation.
    pub fn validate(&self) -> u64 {
        self.with_tree(FormTree::request_validation)
    }

    /// Run `f` against the tree, then start any validation it queued.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut FormTree) -> R) -> R {
        let result = {
            let mut tree = self.tree.lock();
            f(&mut *tree)
        };
        self.dispatch();
        result
    }

    /// Wait until every started validation pass has been applied.
    pub async fn settle(&self) {
        loop {
            let passes = std::mem::take(&mut *self.passes.lock());
            if passes.is_empty() {
                return;
            }
            for pass in passes {
                if let Err(err) = pass.await {
                    warn!(error = %err, "validation pass aborted");
                }
            }
        }
    }

    fn dispatch(&self) {
        let requests = self.tree.lock().take_validation_requests();
        if requests.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                passes = requests.len(),
                "no tokio runtime, validation passes stay queued"
            );
            self.tree.lock().validation.requests.extend(requests);
            return;
        };

        let mut passes = self.passes.lock();
        passes.retain(|pass| !pass.is_finished());
        for request in requests {
            debug!(generation = request.generation, "validation pass started");
            passes.push(runtime.spawn(run_pass(
                Arc::clone(&self.tree),
                Arc::clone(&self.validator),
                request,
            )));
        }
    }
}

async fn run_pass(
    tree: Arc<Mutex<FormTree>>,
    validator: Arc<dyn Validator>,
    request: ValidationRequest,
) {
    if request.deferred {
        tokio::task::yield_now().await;
    }
    let errors = validator.validate(&request.value, &request.schema).await;
    tree.lock().apply_validation(request.generation, errors);
}

fn find(tree: &FormTree, path: &str) -> Result<NodeId> {
    tree.find(path)
        .ok_or_else(|| FormError::NodeNotFound(path.to_string()))
}
