//! Trellis Condition
//!
//! Evaluates the branch conditions gateways and wait elements carry.
//!
//! ```text
//!   ConditionDef ──► ConditionEvaluator ──► registry["greaterThan"] ──► bool
//!                          │
//!                          ├── field value:  EvaluationContext::resolve("account.tier")
//!                          └── subject:      value | field (+shift) | today (+shift)
//! ```
//!
//! A condition with a `fieldValueMap` is a multi-field gate: every pair must
//! match strictly and the operator is not consulted.

mod context;
mod date;
mod error;
mod evaluator;
mod operator;
mod value;

pub use context::{EvaluationContext, required_links};
pub use date::{Moment, ShiftUnit, parse_time_zone};
pub use error::ConditionError;
pub use evaluator::ConditionEvaluator;
pub use operator::Comparison;
pub use value::{loose_eq, strict_eq};
