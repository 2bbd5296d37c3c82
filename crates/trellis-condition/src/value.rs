//! Loose and strict value comparison shared by every operator.
//!
//! Loose rules:
//! - numbers compare as f64, and numeric strings compare as numbers
//! - booleans match `"true"`/`"false"`/`"1"`/`"0"` and `1`/`0`
//! - `null` matches the empty string
//! - date and date-time strings order chronologically

use std::cmp::Ordering;

use chrono::FixedOffset;
use serde_json::Value;

use crate::date::Moment;

fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn as_bool(value: &Value) -> Option<bool> {
  match value {
    Value::Bool(b) => Some(*b),
    Value::Number(n) => match n.as_f64() {
      Some(v) if v == 1.0 => Some(true),
      Some(v) if v == 0.0 => Some(false),
      _ => None,
    },
    Value::String(s) => match s.as_str() {
      "true" | "1" => Some(true),
      "false" | "0" | "" => Some(false),
      _ => None,
    },
    Value::Null => Some(false),
    _ => None,
  }
}

/// Loose equality.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
  match (left, right) {
    (Value::Null, Value::Null) => true,
    (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s.is_empty(),
    (Value::Bool(b), other) | (other, Value::Bool(b)) => as_bool(other) == Some(*b),
    (Value::String(a), Value::String(b)) => a == b,
    (Value::Number(_), _) | (_, Value::Number(_)) => {
      match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
      }
    }
    _ => left == right,
  }
}

/// Strict equality: same JSON type and value; numbers compare as f64 so
/// `1` and `1.0` are equal.
pub fn strict_eq(left: &Value, right: &Value) -> bool {
  match (left, right) {
    (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
    _ => left == right,
  }
}

/// Order two values: numerically, then chronologically, then as strings.
/// `None` when the values are not comparable.
pub fn loose_cmp(left: &Value, right: &Value, time_zone: FixedOffset) -> Option<Ordering> {
  if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
    return a.partial_cmp(&b);
  }
  match (left, right) {
    (Value::String(a), Value::String(b)) => {
      match (Moment::parse(a, time_zone), Moment::parse(b, time_zone)) {
        (Some(a), Some(b)) => Some(a.cmp_moment(&b)),
        _ => Some(a.cmp(b)),
      }
    }
    _ => None,
  }
}

/// `null`, `""`, `[]` and `{}` are empty.
pub fn is_empty(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.is_empty(),
    Value::Array(items) => items.is_empty(),
    Value::Object(map) => map.is_empty(),
    _ => false,
  }
}

pub fn is_truthy(value: &Value) -> bool {
  as_bool(value) == Some(true)
}

/// Substring for strings, loose membership for arrays.
pub fn contains(haystack: &Value, needle: &Value) -> bool {
  match haystack {
    Value::String(s) => match needle {
      Value::String(n) => s.contains(n.as_str()),
      Value::Number(n) => s.contains(&n.to_string()),
      _ => false,
    },
    Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Offset, Utc};
  use serde_json::json;

  fn utc() -> FixedOffset {
    Utc.fix()
  }

  #[test]
  fn test_loose_equality() {
    assert!(loose_eq(&json!("Done"), &json!("Done")));
    assert!(!loose_eq(&json!("Open"), &json!("Done")));
    assert!(loose_eq(&json!(1), &json!("1")));
    assert!(loose_eq(&json!(1.0), &json!(1)));
    assert!(loose_eq(&json!(true), &json!("true")));
    assert!(loose_eq(&json!(false), &json!(0)));
    assert!(loose_eq(&Value::Null, &json!("")));
    assert!(!loose_eq(&Value::Null, &json!(0)));
    assert!(!loose_eq(&json!("abc"), &json!(1)));
  }

  #[test]
  fn test_strict_equality() {
    assert!(strict_eq(&json!(1), &json!(1.0)));
    assert!(!strict_eq(&json!(1), &json!("1")));
    assert!(!strict_eq(&json!(true), &json!("true")));
  }

  #[test]
  fn test_ordering() {
    assert_eq!(loose_cmp(&json!(10), &json!("9"), utc()), Some(Ordering::Greater));
    assert_eq!(
      loose_cmp(&json!("2026-01-02"), &json!("2026-01-01 23:59:59"), utc()),
      Some(Ordering::Greater)
    );
    assert_eq!(loose_cmp(&json!("b"), &json!("a"), utc()), Some(Ordering::Greater));
    assert_eq!(loose_cmp(&Value::Null, &json!(1), utc()), None);
  }

  #[test]
  fn test_contains() {
    assert!(contains(&json!("urgent: call back"), &json!("urgent")));
    assert!(contains(&json!(["a", 2]), &json!("2")));
    assert!(!contains(&json!({ "a": 1 }), &json!("a")));
  }
}
