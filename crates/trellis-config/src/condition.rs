//! Branch condition schema.
//!
//! A condition compares one resolved field of the target entity against a
//! subject:
//!
//! ```json
//! { "fieldToCompare": "status", "subjectType": "value", "value": "Done" }
//! { "fieldToCompare": "closeDate", "comparison": "lessThan", "subjectType": "today", "shiftDays": 7 }
//! { "fieldToCompare": "dueDate", "subjectType": "field", "field": "account.renewalDate", "shiftDays": -1 }
//! ```
//!
//! When `fieldValueMap` is present the condition is a multi-field gate and
//! every pair must match:
//!
//! ```json
//! { "fieldValueMap": { "stage": "Closed Won", "isApproved": true } }
//! ```

use serde::{Deserialize, Serialize};

/// How the right-hand side of a comparison is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
  /// A literal `value`.
  Value,
  /// Another field path on the entity, optionally date-shifted.
  Field,
  /// The current date in the configured time zone, optionally shifted.
  Today,
}

impl SubjectType {
  /// Parse the wire name. Unknown names are left to the evaluator to report,
  /// since only it knows which process the condition belongs to.
  pub fn parse(name: &str) -> Option<Self> {
    match name {
      "value" => Some(Self::Value),
      "field" => Some(Self::Field),
      "today" => Some(Self::Today),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Value => "value",
      Self::Field => "field",
      Self::Today => "today",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDef {
  /// Operator name, resolved against the evaluator's registry.
  #[serde(default = "default_comparison")]
  pub comparison: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field_to_compare: Option<String>,

  /// Kept as a string so an unknown subject type is reported at evaluation
  /// time with the owning process id rather than failing deserialization.
  #[serde(default = "default_subject_type")]
  pub subject_type: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<serde_json::Value>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shift_days: Option<i64>,

  /// `minutes`, `hours`, `days` or `months`. Defaults to days.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shift_units: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field_value_map: Option<serde_json::Map<String, serde_json::Value>>,
}

fn default_comparison() -> String {
  "equals".to_string()
}

fn default_subject_type() -> String {
  SubjectType::Value.as_str().to_string()
}

impl ConditionDef {
  /// A `field == value` condition using the default operator.
  pub fn equals(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
    Self::compare("equals", field, value)
  }

  /// A `field <op> value` condition with a literal subject.
  pub fn compare(
    comparison: impl Into<String>,
    field: impl Into<String>,
    value: impl Into<serde_json::Value>,
  ) -> Self {
    Self {
      comparison: comparison.into(),
      field_to_compare: Some(field.into()),
      subject_type: default_subject_type(),
      value: Some(value.into()),
      field: None,
      shift_days: None,
      shift_units: None,
      field_value_map: None,
    }
  }

  /// A multi-field gate: every key must resolve to exactly the given value.
  pub fn all_match(map: serde_json::Map<String, serde_json::Value>) -> Self {
    Self {
      comparison: default_comparison(),
      field_to_compare: None,
      subject_type: default_subject_type(),
      value: None,
      field: None,
      shift_days: None,
      shift_units: None,
      field_value_map: Some(map),
    }
  }

  /// Whether this is a multi-field (`fieldValueMap`) condition.
  pub fn is_complex(&self) -> bool {
    self.field_value_map.is_some()
  }

  /// Every field path this condition reads, including the subject field.
  pub fn field_paths(&self) -> Vec<&str> {
    let mut paths = Vec::new();
    if let Some(map) = &self.field_value_map {
      paths.extend(map.keys().map(String::as_str));
    }
    if let Some(field) = &self.field_to_compare {
      paths.push(field);
    }
    if let Some(field) = &self.field {
      paths.push(field);
    }
    paths
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_defaults_on_minimal_condition() {
    let condition: ConditionDef =
      serde_json::from_value(json!({ "fieldToCompare": "status", "value": "Done" })).unwrap();

    assert_eq!(condition.comparison, "equals");
    assert_eq!(condition.subject_type, "value");
    assert!(!condition.is_complex());
  }

  #[test]
  fn test_unknown_subject_type_survives_deserialization() {
    let condition: ConditionDef = serde_json::from_value(json!({
      "fieldToCompare": "status",
      "subjectType": "yesterday"
    }))
    .unwrap();

    assert_eq!(SubjectType::parse(&condition.subject_type), None);
  }

  #[test]
  fn test_field_paths_include_map_keys_and_subject_field() {
    let condition: ConditionDef = serde_json::from_value(json!({
      "fieldToCompare": "closeDate",
      "subjectType": "field",
      "field": "account.renewalDate"
    }))
    .unwrap();
    assert_eq!(condition.field_paths(), vec!["closeDate", "account.renewalDate"]);

    let mut map = serde_json::Map::new();
    map.insert("a".to_string(), json!(1));
    assert_eq!(ConditionDef::all_match(map).field_paths(), vec!["a"]);
  }
}
