//! Node Graph
//!
//! This module implements the live tree of form nodes that mirrors the
//! effective schema and holds the form's value.
//!
//! # Overview
//!
//! - Object nodes own one child per declared property plus one virtual node
//!   per `virtual` declaration.
//! - Array nodes own one child per element.
//! - Leaf nodes hold a coerced primitive.
//! - Virtual nodes own nothing; they aggregate sibling values into a tuple.
//!
//! Values flow upward: a child change is folded into its parent's draft and
//! the parent re-emits, up to the root. Writes flow downward: a composite
//! value is split across the children.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a single arena ([`FormTree`]) indexed by [`NodeId`]. A
//!    child refers to its parent by id, so there are no reference cycles.
//!
//! 2. Node ids are never reused. Removing an array element renumbers the
//!    exposed names of its later siblings but keeps their ids.

mod coerce;
mod node;
mod scheduler;
mod tree;

pub use coerce::coerce;
pub use node::{ArrayState, FormNode, NodeId, NodeKind, ObjectState, VirtualState};
pub use scheduler::UpdateScheduler;
pub use tree::{ChangeSink, FormTree};
