//! Trellis Config
//!
//! This crate contains the serializable configuration types for Trellis.
//! Process definitions are authored as JSON and stored verbatim on every
//! process instance, so the types here are the single source of truth for
//! the definition format.
//!
//! Configuration can be loaded from:
//! - JSON definition files (via CLI with `trellis definition register`)
//! - The `definition` column of a stored process (as a JSON blob)
//! - An engine settings file (via CLI with `--config=trellis.json`)
//!
//! The engine takes these types, validates them into a locked
//! `ProcessDefinition` (see `trellis-definition`) and advances processes
//! against that.

mod condition;
mod element;
mod flow;
mod process;
mod settings;

pub use condition::{ConditionDef, SubjectType};
pub use element::{ElementDef, ElementType};
pub use flow::{Branch, FlowDef};
pub use process::{ProcessDef, TriggerDef, TriggerOn};
pub use settings::{EngineSettings, SchedulingMode};
