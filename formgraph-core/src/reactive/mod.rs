//! Reactive Core
//!
//! This module implements change notification and the dependency tracking
//! that keeps computed fields up to date.
//!
//! # Concepts
//!
//! ## Events
//!
//! Every node owns an [`EventBus`]. Listeners receive a [`ChangeEvent`]
//! synchronously when the node's value, path, state or errors change.
//! Events are never buffered; a listener that subscribes late only sees
//! later events.
//!
//! ## Expressions
//!
//! Computed keywords compile to expressions reading other fields through
//! relative pointers. When a node is built, each pointer is bound to an
//! absolute [`PathPattern`](crate::expr::PathPattern) and recorded in a
//! [`DependencyIndex`]. A write marks its path dirty; the next flush
//! re-evaluates the expressions whose patterns overlap a dirty path.
//!
//! # Implementation Notes
//!
//! Dependencies are declared by the pointers an expression contains, not
//! discovered while it runs. The set of bindings is therefore known as soon
//! as a node exists and never changes while it lives.

mod bus;
mod event;
mod subscriber;
mod tracker;

pub use bus::EventBus;
pub use event::{ChangeEvent, EventKind};
pub use subscriber::{Subscriber, SubscriberId};
pub use tracker::{DependencyIndex, ExprRef, ExprSlot};
