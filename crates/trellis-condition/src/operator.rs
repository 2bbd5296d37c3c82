use std::cmp::Ordering;

use chrono::FixedOffset;
use serde_json::Value;

use crate::value;

/// One comparison strategy, registered under an operator name.
///
/// The evaluator resolves both sides before calling [`Comparison::compare`],
/// so strategies only decide how two values relate.
pub trait Comparison: Send + Sync {
  fn compare(&self, field_value: &Value, subject: &Value, time_zone: FixedOffset) -> bool;

  /// Unary operators (`isEmpty`, `isTrue`, ...) ignore the subject and do
  /// not require one to be configured.
  fn needs_subject(&self) -> bool {
    true
  }
}

/// The default operator: loose equality.
pub struct Equals;

impl Comparison for Equals {
  fn compare(&self, field_value: &Value, subject: &Value, _: FixedOffset) -> bool {
    value::loose_eq(field_value, subject)
  }
}

pub struct NotEquals;

impl Comparison for NotEquals {
  fn compare(&self, field_value: &Value, subject: &Value, _: FixedOffset) -> bool {
    !value::loose_eq(field_value, subject)
  }
}

/// Ordering comparisons. Incomparable values never match.
pub struct Ordered {
  accepts: fn(Ordering) -> bool,
}

impl Ordered {
  pub const GREATER_THAN: Self = Self {
    accepts: Ordering::is_gt,
  };
  pub const LESS_THAN: Self = Self {
    accepts: Ordering::is_lt,
  };
  pub const GREATER_THAN_OR_EQUALS: Self = Self {
    accepts: Ordering::is_ge,
  };
  pub const LESS_THAN_OR_EQUALS: Self = Self {
    accepts: Ordering::is_le,
  };
}

impl Comparison for Ordered {
  fn compare(&self, field_value: &Value, subject: &Value, time_zone: FixedOffset) -> bool {
    value::loose_cmp(field_value, subject, time_zone).is_some_and(self.accepts)
  }
}

pub struct IsEmpty {
  pub negate: bool,
}

impl Comparison for IsEmpty {
  fn compare(&self, field_value: &Value, _: &Value, _: FixedOffset) -> bool {
    value::is_empty(field_value) != self.negate
  }

  fn needs_subject(&self) -> bool {
    false
  }
}

pub struct IsTrue {
  pub negate: bool,
}

impl Comparison for IsTrue {
  fn compare(&self, field_value: &Value, _: &Value, _: FixedOffset) -> bool {
    value::is_truthy(field_value) != self.negate
  }

  fn needs_subject(&self) -> bool {
    false
  }
}

pub struct Contains {
  pub negate: bool,
}

impl Comparison for Contains {
  fn compare(&self, field_value: &Value, subject: &Value, _: FixedOffset) -> bool {
    value::contains(field_value, subject) != self.negate
  }
}
