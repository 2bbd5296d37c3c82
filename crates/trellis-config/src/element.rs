use serde::{Deserialize, Serialize};

use crate::condition::ConditionDef;
use crate::process::ProcessDef;

/// One element of a process definition graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDef {
  pub element_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(flatten)]
  pub element_type: ElementType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ElementType {
  /// Where a process begins. One flow node is created per start event.
  StartEvent,

  /// Marks the end of a branch.
  EndEvent,

  /// Runs a side-effecting action through the action dispatcher.
  Task {
    /// Declarative action payload, e.g. `{"type": "sendEmail", ...}`.
    action: serde_json::Value,
  },

  /// Follows `true` edges when the condition holds, `false` edges otherwise.
  Gateway { condition: ConditionDef },

  /// Held back (deferred) until its target entity is saved.
  #[serde(rename_all = "camelCase")]
  Wait {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<ConditionDef>,
    /// Defaults to the process target when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<String>,
  },

  /// Runs an embedded definition as a child process.
  SubProcess { definition: Box<ProcessDef> },
}

impl ElementType {
  /// Short kind name used in logs and events.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::StartEvent => "startEvent",
      Self::EndEvent => "endEvent",
      Self::Task { .. } => "task",
      Self::Gateway { .. } => "gateway",
      Self::Wait { .. } => "wait",
      Self::SubProcess { .. } => "subProcess",
    }
  }
}

impl ElementDef {
  pub fn new(element_id: impl Into<String>, element_type: ElementType) -> Self {
    Self {
      element_id: element_id.into(),
      name: None,
      element_type,
    }
  }

  pub fn is_start(&self) -> bool {
    matches!(self.element_type, ElementType::StartEvent)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_gateway_element() {
    let element: ElementDef = serde_json::from_value(json!({
      "elementId": "check-status",
      "type": "gateway",
      "condition": { "fieldToCompare": "status", "value": "Done" }
    }))
    .unwrap();

    assert_eq!(element.element_id, "check-status");
    match element.element_type {
      ElementType::Gateway { condition } => {
        assert_eq!(condition.field_to_compare.as_deref(), Some("status"));
      }
      other => panic!("expected gateway, got {:?}", other),
    }
  }

  #[test]
  fn test_parse_wait_element_with_explicit_target() {
    let element: ElementDef = serde_json::from_value(json!({
      "elementId": "await-contract",
      "type": "wait",
      "targetType": "Contract",
      "targetId": "c-1"
    }))
    .unwrap();

    assert_eq!(
      element.element_type,
      ElementType::Wait {
        condition: None,
        target_type: Some("Contract".to_string()),
        target_id: Some("c-1".to_string()),
      }
    );
    assert_eq!(element.element_type.kind(), "wait");
  }

  #[test]
  fn test_task_action_kept_opaque() {
    let element: ElementDef = serde_json::from_value(json!({
      "elementId": "notify",
      "type": "task",
      "action": { "type": "sendEmail", "to": "targetEntity", "emailTemplateId": "t1" }
    }))
    .unwrap();

    match element.element_type {
      ElementType::Task { action } => assert_eq!(action["emailTemplateId"], "t1"),
      other => panic!("expected task, got {:?}", other),
    }
  }
}
