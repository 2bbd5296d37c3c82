/// Errors from condition evaluation.
///
/// Every variant is a configuration error: the condition as authored cannot
/// be evaluated, and retrying will not help. Each carries the owning process
/// id so the offending definition can be traced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
  #[error("process '{process_id}': unknown subject type '{subject_type}'")]
  UnknownSubjectType {
    process_id: String,
    subject_type: String,
  },

  #[error("process '{process_id}': unknown comparison '{comparison}'")]
  UnknownComparison {
    process_id: String,
    comparison: String,
  },

  #[error("process '{process_id}': condition is missing '{field}'")]
  MissingField {
    process_id: String,
    field: &'static str,
  },

  #[error("process '{process_id}': '{value}' is not a date")]
  InvalidDate { process_id: String, value: String },

  #[error("process '{process_id}': unknown shift unit '{unit}'")]
  InvalidShiftUnit { process_id: String, unit: String },

  #[error("invalid time zone '{0}', expected 'UTC' or an offset like '+02:00'")]
  InvalidTimeZone(String),
}
