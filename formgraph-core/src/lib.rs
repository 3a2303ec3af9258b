//! FormGraph Core
//!
//! This crate provides the reactive data-modeling core of a JSON Schema
//! driven form engine. It implements:
//!
//! - Schema composition (`allOf` merging, `anyOf`/`oneOf` distribution)
//! - A live node graph mirroring the schema and holding the form value
//! - Per-node change notification
//! - Computed fields driven by pointer expressions
//! - Distribution of validator errors onto the nodes they concern
//!
//! Rendering, widgets and the validator itself live outside this crate.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `schema`: resolves a raw schema into effective schemas
//! - `expr`: the pointer expression language of computed keywords
//! - `graph`: the node arena and value propagation
//! - `reactive`: event buses and dependency tracking
//! - `validation`: the validator capability and error distribution
//! - `form`: an async handle running validation passes on tokio
//!
//! # Example
//!
//! ```rust,ignore
//! use formgraph_core::{FormOptions, FormTree};
//! use serde_json::json;
//!
//! let schema = json!({
//!     "type": "object",
//!     "properties": {
//!         "price": { "type": "number" },
//!         "quantity": { "type": "integer", "default": 1 },
//!         "total": { "type": "number", "&value": "../price * ../quantity" }
//!     }
//! });
//!
//! let mut tree = FormTree::new(&schema, None, FormOptions::default())?;
//! tree.set_value_at("/price", Some(json!(2.5)))?;
//! assert_eq!(tree.value()["total"], json!(2.5));
//! ```

pub mod config;
pub mod error;
pub mod expr;
pub mod form;
pub mod graph;
pub mod reactive;
pub mod schema;
pub mod validation;

pub use config::{FormOptions, ValidationOrdering};
pub use error::{FormError, Result, SchemaError};
pub use form::Form;
pub use graph::{FormNode, FormTree, NodeId, NodeKind};
pub use reactive::{ChangeEvent, EventKind, SubscriberId};
pub use schema::{resolve, EffectiveSchema, SchemaKind};
pub use validation::{JsonSchemaValidator, ValidationError, ValidationRequest, Validator};
