use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use trellis_config::{ConditionDef, SubjectType};

use crate::context::EvaluationContext;
use crate::date::{Moment, ShiftUnit};
use crate::error::ConditionError;
use crate::operator::{Comparison, Contains, Equals, IsEmpty, IsTrue, NotEquals, Ordered};
use crate::value;

/// Evaluates branch conditions against an [`EvaluationContext`].
///
/// Operators are looked up by name in a registry; [`ConditionEvaluator::new`]
/// registers the built-ins and [`ConditionEvaluator::register`] adds or
/// replaces one.
#[derive(Clone)]
pub struct ConditionEvaluator {
  comparisons: HashMap<String, Arc<dyn Comparison>>,
}

impl Default for ConditionEvaluator {
  fn default() -> Self {
    Self::new()
  }
}

impl ConditionEvaluator {
  pub fn new() -> Self {
    let mut evaluator = Self {
      comparisons: HashMap::new(),
    };
    evaluator
      .register("equals", Equals)
      .register("notEquals", NotEquals)
      .register("greaterThan", Ordered::GREATER_THAN)
      .register("lessThan", Ordered::LESS_THAN)
      .register("greaterThanOrEquals", Ordered::GREATER_THAN_OR_EQUALS)
      .register("lessThanOrEquals", Ordered::LESS_THAN_OR_EQUALS)
      .register("isEmpty", IsEmpty { negate: false })
      .register("isNotEmpty", IsEmpty { negate: true })
      .register("isTrue", IsTrue { negate: false })
      .register("isFalse", IsTrue { negate: true })
      .register("contains", Contains { negate: false })
      .register("notContains", Contains { negate: true });
    evaluator
  }

  /// Register a comparison under `name`, replacing any previous one.
  pub fn register(
    &mut self,
    name: impl Into<String>,
    comparison: impl Comparison + 'static,
  ) -> &mut Self {
    self.comparisons.insert(name.into(), Arc::new(comparison));
    self
  }

  pub fn has_comparison(&self, name: &str) -> bool {
    self.comparisons.contains_key(name)
  }

  /// Evaluate a condition. Configuration problems are errors; values that
  /// merely fail to resolve compare as `null`.
  pub fn evaluate(
    &self,
    condition: &ConditionDef,
    ctx: &EvaluationContext<'_>,
  ) -> Result<bool, ConditionError> {
    subject_type(condition, ctx)?;
    let result = match &condition.field_value_map {
      Some(map) => self.compare_complex(map, ctx),
      None => self.compare_simple(condition, ctx)?,
    };

    tracing::debug!(
      process_id = %ctx.process_id,
      comparison = %condition.comparison,
      complex = condition.is_complex(),
      result,
      "condition_evaluated"
    );
    Ok(result)
  }

  /// Every pair must match strictly.
  fn compare_complex(&self, map: &serde_json::Map<String, Value>, ctx: &EvaluationContext<'_>) -> bool {
    map
      .iter()
      .all(|(path, expected)| value::strict_eq(&ctx.resolve(path), expected))
  }

  fn compare_simple(
    &self,
    condition: &ConditionDef,
    ctx: &EvaluationContext<'_>,
  ) -> Result<bool, ConditionError> {
    let comparison =
      self
        .comparisons
        .get(&condition.comparison)
        .ok_or_else(|| ConditionError::UnknownComparison {
          process_id: ctx.process_id.to_string(),
          comparison: condition.comparison.clone(),
        })?;

    let field = condition
      .field_to_compare
      .as_deref()
      .ok_or_else(|| missing(ctx, "fieldToCompare"))?;
    let field_value = ctx.resolve(field);

    let subject = if comparison.needs_subject() {
      self.resolve_subject(condition, ctx)?
    } else {
      Value::Null
    };

    Ok(comparison.compare(&field_value, &subject, ctx.time_zone))
  }

  /// Resolve the right-hand side of a simple condition.
  pub fn resolve_subject(
    &self,
    condition: &ConditionDef,
    ctx: &EvaluationContext<'_>,
  ) -> Result<Value, ConditionError> {
    let subject_type = subject_type(condition, ctx)?;

    let unit = ShiftUnit::parse(condition.shift_units.as_deref()).ok_or_else(|| {
      ConditionError::InvalidShiftUnit {
        process_id: ctx.process_id.to_string(),
        unit: condition.shift_units.clone().unwrap_or_default(),
      }
    })?;
    let shift = condition.shift_days.unwrap_or(0);

    match subject_type {
      SubjectType::Value => condition
        .value
        .clone()
        .ok_or_else(|| missing(ctx, "value")),
      SubjectType::Field => {
        let path = condition.field.as_deref().ok_or_else(|| missing(ctx, "field"))?;
        let resolved = ctx.resolve(path);
        match (&resolved, condition.shift_days) {
          (Value::String(raw), Some(_)) => {
            let moment = Moment::parse(raw, ctx.time_zone).ok_or_else(|| invalid_date(ctx, raw))?;
            shifted(moment, shift, unit, ctx, raw)
          }
          // Nothing to shift; an unset field stays null.
          _ => Ok(resolved),
        }
      }
      SubjectType::Today => {
        let today = Moment::today(ctx.now, ctx.time_zone, unit);
        shifted(today, shift, unit, ctx, "today")
      }
    }
  }
}

fn shifted(
  moment: Moment,
  amount: i64,
  unit: ShiftUnit,
  ctx: &EvaluationContext<'_>,
  raw: &str,
) -> Result<Value, ConditionError> {
  moment
    .shift(amount, unit)
    .map(|m| Value::String(m.format()))
    .ok_or_else(|| invalid_date(ctx, raw))
}

/// Rejected up front, even when the operator never reads a subject.
fn subject_type(
  condition: &ConditionDef,
  ctx: &EvaluationContext<'_>,
) -> Result<SubjectType, ConditionError> {
  SubjectType::parse(&condition.subject_type).ok_or_else(|| ConditionError::UnknownSubjectType {
    process_id: ctx.process_id.to_string(),
    subject_type: condition.subject_type.clone(),
  })
}

fn missing(ctx: &EvaluationContext<'_>, field: &'static str) -> ConditionError {
  ConditionError::MissingField {
    process_id: ctx.process_id.to_string(),
    field,
  }
}

fn invalid_date(ctx: &EvaluationContext<'_>, value: &str) -> ConditionError {
  ConditionError::InvalidDate {
    process_id: ctx.process_id.to_string(),
    value: value.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{DateTime, Utc};
  use serde_json::json;

  fn condition(value: Value) -> ConditionDef {
    serde_json::from_value(value).unwrap()
  }

  fn eval(cond: Value, entity: Value) -> Result<bool, ConditionError> {
    let linked = HashMap::new();
    let variables = json!({});
    let ctx = EvaluationContext::new("p-1", &entity, &linked, &variables);
    ConditionEvaluator::new().evaluate(&condition(cond), &ctx)
  }

  fn noon() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-10T12:00:00Z")
      .unwrap()
      .with_timezone(&Utc)
  }

  #[test]
  fn test_equals_against_literal() {
    let cond = json!({ "fieldToCompare": "status", "subjectType": "value", "value": "Done" });
    assert!(eval(cond.clone(), json!({ "status": "Done" })).unwrap());
    assert!(!eval(cond, json!({ "status": "Open" })).unwrap());
  }

  #[test]
  fn test_complex_requires_every_pair() {
    let cond = json!({ "fieldValueMap": { "a": 1, "b": 2 } });
    assert!(!eval(cond.clone(), json!({ "a": 1, "b": 3 })).unwrap());
    assert!(eval(cond.clone(), json!({ "a": 1, "b": 2 })).unwrap());
    // Strict: a numeric string is not the number.
    assert!(!eval(cond, json!({ "a": "1", "b": 2 })).unwrap());
  }

  #[test]
  fn test_unknown_subject_type_names_the_process() {
    let err = eval(
      json!({ "fieldToCompare": "status", "subjectType": "yesterday" }),
      json!({}),
    )
    .unwrap_err();
    assert_eq!(
      err,
      ConditionError::UnknownSubjectType {
        process_id: "p-1".to_string(),
        subject_type: "yesterday".to_string(),
      }
    );
    assert!(err.to_string().contains("p-1"));
  }

  #[test]
  fn test_unknown_subject_type_rejected_for_unary_operator() {
    let err = eval(
      json!({ "fieldToCompare": "flag", "comparison": "isTrue", "subjectType": "tomorrow" }),
      json!({ "flag": true }),
    )
    .unwrap_err();
    assert!(matches!(
      err,
      ConditionError::UnknownSubjectType { ref subject_type, .. } if subject_type == "tomorrow"
    ));
  }

  #[test]
  fn test_configuration_errors() {
    assert!(matches!(
      eval(json!({ "comparison": "matches", "fieldToCompare": "a", "value": 1 }), json!({})),
      Err(ConditionError::UnknownComparison { .. })
    ));
    assert!(matches!(
      eval(json!({ "value": 1 }), json!({})),
      Err(ConditionError::MissingField { field: "fieldToCompare", .. })
    ));
    assert!(matches!(
      eval(json!({ "fieldToCompare": "a" }), json!({})),
      Err(ConditionError::MissingField { field: "value", .. })
    ));
    assert!(matches!(
      eval(
        json!({ "fieldToCompare": "a", "subjectType": "today", "shiftUnits": "weeks" }),
        json!({})
      ),
      Err(ConditionError::InvalidShiftUnit { .. })
    ));
  }

  #[test]
  fn test_unary_operators_need_no_subject() {
    assert!(eval(json!({ "comparison": "isEmpty", "fieldToCompare": "note" }), json!({})).unwrap());
    assert!(
      eval(
        json!({ "comparison": "isNotEmpty", "fieldToCompare": "note" }),
        json!({ "note": "x" })
      )
      .unwrap()
    );
    assert!(
      eval(
        json!({ "comparison": "isTrue", "fieldToCompare": "approved" }),
        json!({ "approved": true })
      )
      .unwrap()
    );
    assert!(eval(json!({ "comparison": "isFalse", "fieldToCompare": "approved" }), json!({})).unwrap());
  }

  #[test]
  fn test_ordering_and_membership_operators() {
    let entity = json!({ "amount": 120, "tags": ["vip", "eu"], "subject": "Re: invoice" });
    let cases = [
      (json!({ "comparison": "greaterThan", "fieldToCompare": "amount", "value": 100 }), true),
      (json!({ "comparison": "lessThan", "fieldToCompare": "amount", "value": "100" }), false),
      (json!({ "comparison": "greaterThanOrEquals", "fieldToCompare": "amount", "value": 120 }), true),
      (json!({ "comparison": "lessThanOrEquals", "fieldToCompare": "amount", "value": 119.5 }), false),
      (json!({ "comparison": "contains", "fieldToCompare": "tags", "value": "vip" }), true),
      (json!({ "comparison": "notContains", "fieldToCompare": "subject", "value": "invoice" }), false),
      (json!({ "comparison": "notEquals", "fieldToCompare": "amount", "value": "120" }), false),
    ];
    for (cond, expected) in cases {
      assert_eq!(eval(cond.clone(), entity.clone()).unwrap(), expected, "{}", cond);
    }
  }

  #[test]
  fn test_today_subject_with_shift() {
    let entity = json!({ "closeDate": "2026-03-15" });
    let linked = HashMap::new();
    let variables = json!({});
    let ctx = EvaluationContext::new("p-1", &entity, &linked, &variables).at(noon());
    let evaluator = ConditionEvaluator::new();

    let within_week = condition(json!({
      "comparison": "lessThanOrEquals",
      "fieldToCompare": "closeDate",
      "subjectType": "today",
      "shiftDays": 7
    }));
    assert!(evaluator.evaluate(&within_week, &ctx).unwrap());
    assert_eq!(
      evaluator.resolve_subject(&within_week, &ctx).unwrap(),
      json!("2026-03-17")
    );

    let in_two_hours = condition(json!({
      "fieldToCompare": "closeDate",
      "subjectType": "today",
      "shiftDays": 2,
      "shiftUnits": "hours"
    }));
    assert_eq!(
      evaluator.resolve_subject(&in_two_hours, &ctx).unwrap(),
      json!("2026-03-10 14:00:00")
    );
  }

  #[test]
  fn test_field_subject_through_link() {
    let entity = json!({ "dueDate": "2026-04-30" });
    let mut linked = HashMap::new();
    linked.insert("contract".to_string(), json!({ "endDate": "2026-05-01" }));
    let variables = json!({});
    let ctx = EvaluationContext::new("p-1", &entity, &linked, &variables);

    let cond = condition(json!({
      "fieldToCompare": "dueDate",
      "subjectType": "field",
      "field": "contract.endDate",
      "shiftDays": -1
    }));
    assert!(ConditionEvaluator::new().evaluate(&cond, &ctx).unwrap());

    let bad = condition(json!({
      "fieldToCompare": "dueDate",
      "subjectType": "field",
      "field": "contract.name",
      "shiftDays": 1
    }));
    let mut linked = HashMap::new();
    linked.insert("contract".to_string(), json!({ "name": "Gold" }));
    let ctx = EvaluationContext::new("p-1", &entity, &linked, &variables);
    assert!(matches!(
      ConditionEvaluator::new().evaluate(&bad, &ctx),
      Err(ConditionError::InvalidDate { value, .. }) if value == "Gold"
    ));
  }

  #[test]
  fn test_variables_and_custom_operator() {
    struct StartsWith;
    impl Comparison for StartsWith {
      fn compare(&self, field_value: &Value, subject: &Value, _: chrono::FixedOffset) -> bool {
        match (field_value.as_str(), subject.as_str()) {
          (Some(f), Some(s)) => f.starts_with(s),
          _ => false,
        }
      }
    }

    let mut evaluator = ConditionEvaluator::new();
    evaluator.register("startsWith", StartsWith);

    let entity = json!({});
    let linked = HashMap::new();
    let variables = json!({ "region": "eu-west" });
    let ctx = EvaluationContext::new("p-1", &entity, &linked, &variables);
    let cond = condition(json!({
      "comparison": "startsWith",
      "fieldToCompare": "$region",
      "value": "eu"
    }));
    assert!(evaluator.evaluate(&cond, &ctx).unwrap());
  }
}
