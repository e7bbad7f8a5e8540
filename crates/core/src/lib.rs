//! Accord coordination template model -- immutable, versioned workflow
//! definitions consumed by the run engine.
//!
//! A template describes the roles that may participate, the data slots
//! collected along the way, and the states of the workflow together with
//! an explicit transition table. Templates are validated once at publish
//! time by [`compile`]; a compiled [`Template`] is never mutated -- a new
//! version is a new template row under the same `(space_id, name)` pair.
//!
//! The transition graph is a general directed graph. Back-edges (e.g.
//! `negotiate -> collect`) are legal; nothing in this crate assumes a DAG,
//! and the advisory `sequence` field on states is never consulted for
//! legality.

pub mod compile;
mod error;
mod template;

pub use compile::compile;
pub use error::{ValidationError, ValidationIssue};
pub use template::{
    Role, SlotDef, SlotType, StateDef, Template, TemplateKey, TransitionTable, Transitions,
};
