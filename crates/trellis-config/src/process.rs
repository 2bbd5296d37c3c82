use serde::{Deserialize, Serialize};

use crate::condition::ConditionDef;
use crate::element::ElementDef;
use crate::flow::FlowDef;

/// A serializable process definition.
///
/// ```json
/// {
///   "name": "Follow up closed cases",
///   "targetType": "Case",
///   "trigger": { "on": "recordSaved", "condition": { "fieldToCompare": "status", "value": "Closed" } },
///   "elements": [
///     { "elementId": "start", "type": "startEvent" },
///     { "elementId": "notify", "type": "task", "action": { "type": "sendEmail", "...": "..." } },
///     { "elementId": "end", "type": "endEvent" }
///   ],
///   "flows": [
///     { "from": "start", "to": "notify" },
///     { "from": "notify", "to": "end" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDef {
  pub name: String,
  /// Entity type the process operates on, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_type: Option<String>,
  /// Automatic start rule; definitions without one are started explicitly.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trigger: Option<TriggerDef>,
  pub elements: Vec<ElementDef>,
  #[serde(default)]
  pub flows: Vec<FlowDef>,
}

/// When a saved entity starts a new process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
  pub on: TriggerOn,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<ConditionDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerOn {
  /// Only the first save of a record.
  RecordCreated,
  /// Every save of a record.
  RecordSaved,
}

impl TriggerOn {
  pub fn matches(&self, is_new: bool) -> bool {
    match self {
      Self::RecordCreated => is_new,
      Self::RecordSaved => true,
    }
  }
}
