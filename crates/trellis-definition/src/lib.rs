//! Trellis Definition
//!
//! This crate provides the "locked" process definition for Trellis.
//! A locked definition is a validated form of a `ProcessDef` that the flow
//! advancer walks when it creates successor flow nodes.
//!
//! Key differences from `trellis-config`:
//! - Graph structure is validated (known elements, one or more start events)
//! - Gateway branches are checked (`true`/`false` edges only leave gateways)
//! - Nested sub-process definitions are validated recursively
//! - Successors can be looked up per branch outcome

mod definition;
mod error;
mod graph;

pub use definition::ProcessDefinition;
pub use error::DefinitionError;
pub use graph::Graph;
