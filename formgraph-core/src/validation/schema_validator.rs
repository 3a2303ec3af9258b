//! JSON Schema Validator Adapter
//!
//! A [`Validator`] backed by the `jsonschema` crate. The compiled schema is
//! cached and rebuilt only when a different schema document arrives.

use futures_util::future::{self, BoxFuture, FutureExt};
use jsonschema::error::ValidationErrorKind;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::{ValidationError, Validator};
use crate::expr::join_pointer;

struct Compiled {
    schema: Value,
    validator: jsonschema::Validator,
}

/// Validates with the `jsonschema` crate.
#[derive(Default)]
pub struct JsonSchemaValidator {
    compiled: Mutex<Option<Compiled>>,
}

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the validator synchronously.
    pub fn validate_now(&self, value: &Value, schema: &Value) -> Vec<ValidationError> {
        let mut compiled = self.compiled.lock();
        if compiled.as_ref().map(|c| &c.schema) != Some(schema) {
            match jsonschema::validator_for(schema) {
                Ok(validator) => {
                    *compiled = Some(Compiled {
                        schema: schema.clone(),
                        validator,
                    })
                }
                Err(err) => {
                    warn!(error = %err, "schema rejected by validator");
                    *compiled = None;
                    return vec![ValidationError::new("", "schema", err.to_string())];
                }
            }
        }
        let Some(compiled) = compiled.as_ref() else {
            return Vec::new();
        };

        compiled
            .validator
            .iter_errors(value)
            .map(|e| {
                let keyword = e
                    .schema_path
                    .to_string()
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let mut data_path = e.instance_path.to_string();
                // A missing property is reported where it would live.
                if let ValidationErrorKind::Required { property } = &e.kind {
                    if let Some(name) = property.as_str() {
                        data_path = join_pointer(&data_path, name);
                    }
                }
                ValidationError::new(data_path, keyword, e.to_string())
            })
            .collect()
    }
}

impl Validator for JsonSchemaValidator {
    fn validate<'a>(
        &'a self,
        value: &'a Value,
        schema: &'a Value,
    ) -> BoxFuture<'a, Vec<ValidationError>> {
        future::ready(self.validate_now(value, schema)).boxed()
    }
}
