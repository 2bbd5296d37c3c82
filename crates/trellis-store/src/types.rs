use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use trellis_config::{ElementDef, ProcessDef};

use crate::Error;

/// Lifecycle status of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProcessStatus {
  Created,
  Started,
  Ended,
  Interrupted,
}

/// Status of a flow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FlowNodeStatus {
  Pending,
  Standby,
  Processed,
  Rejected,
  Failed,
}

impl FlowNodeStatus {
  /// Terminal statuses are never left.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Processed | Self::Rejected | Self::Failed)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Standby => "standby",
      Self::Processed => "processed",
      Self::Rejected => "rejected",
      Self::Failed => "failed",
    }
  }
}

/// A process instance as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Process {
  pub id: String,
  pub name: String,
  /// Back-reference to the owning process; parents never list children.
  pub parent_process_id: Option<String>,
  pub parent_flow_node_id: Option<String>,
  pub status: ProcessStatus,
  pub is_locked: bool,
  /// Heartbeat in epoch milliseconds, bumped on every lock acquire/release.
  pub visit_timestamp: i64,
  pub target_type: Option<String>,
  pub target_id: Option<String>,
  /// Snapshot of the definition the process was started from.
  pub definition: Json<ProcessDef>,
  pub variables: Json<serde_json::Value>,
  pub deleted: bool,
  pub created_at: DateTime<Utc>,
}

impl Process {
  /// A new root process in `created` status.
  pub fn new(definition: ProcessDef) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      name: definition.name.clone(),
      parent_process_id: None,
      parent_flow_node_id: None,
      status: ProcessStatus::Created,
      is_locked: false,
      visit_timestamp: 0,
      target_type: None,
      target_id: None,
      definition: Json(definition),
      variables: Json(serde_json::Value::Object(Default::default())),
      deleted: false,
      created_at: Utc::now(),
    }
  }

  pub fn with_target(mut self, target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
    self.target_type = Some(target_type.into());
    self.target_id = Some(target_id.into());
    self
  }

  pub fn with_parent(
    mut self,
    parent_process_id: impl Into<String>,
    parent_flow_node_id: impl Into<String>,
  ) -> Self {
    self.parent_process_id = Some(parent_process_id.into());
    self.parent_flow_node_id = Some(parent_flow_node_id.into());
    self
  }

  pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
    self.variables = Json(variables);
    self
  }

  /// A root process has no parent.
  pub fn is_root(&self) -> bool {
    self.parent_process_id.is_none()
  }

  /// The target entity, when both halves are set.
  pub fn target(&self) -> Option<EntityRef> {
    match (&self.target_type, &self.target_id) {
      (Some(entity_type), Some(id)) => Some(EntityRef::new(entity_type, id)),
      _ => None,
    }
  }
}

/// One step of a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
  pub id: String,
  pub process_id: String,
  pub element_id: String,
  pub element_type: String,
  pub status: FlowNodeStatus,
  /// Held back from advancement until a save of the target clears it.
  pub is_deferred: bool,
  pub target_type: Option<String>,
  pub target_id: Option<String>,
  pub element_data: Json<ElementDef>,
  /// Runtime data, e.g. the id of a spawned sub-process.
  pub data: Json<serde_json::Value>,
  pub previous_flow_node_id: Option<String>,
  /// Process-local creation order.
  pub sequence: i64,
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub processed_at: Option<DateTime<Utc>>,
}

impl FlowNode {
  /// A new pending node for `element` in `process_id`.
  pub fn new(process_id: impl Into<String>, element: &ElementDef, sequence: i64) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      process_id: process_id.into(),
      element_id: element.element_id.clone(),
      element_type: element.element_type.kind().to_string(),
      status: FlowNodeStatus::Pending,
      is_deferred: false,
      target_type: None,
      target_id: None,
      element_data: Json(element.clone()),
      data: Json(serde_json::Value::Object(Default::default())),
      previous_flow_node_id: None,
      sequence,
      error: None,
      created_at: Utc::now(),
      processed_at: None,
    }
  }

  pub fn with_previous(mut self, previous_flow_node_id: impl Into<String>) -> Self {
    self.previous_flow_node_id = Some(previous_flow_node_id.into());
    self
  }

  /// Eligible for advancement: open and not deferred.
  pub fn is_actionable(&self) -> bool {
    !self.status.is_terminal() && !self.is_deferred
  }

  /// Hold the node back until `target` is saved.
  pub fn defer_on(&mut self, target: &EntityRef) {
    self.target_type = Some(target.entity_type.clone());
    self.target_id = Some(target.id.clone());
    self.is_deferred = true;
  }

  pub fn mark_standby(&mut self) -> Result<(), Error> {
    self.transition(FlowNodeStatus::Standby)
  }

  pub fn mark_processed(&mut self) -> Result<(), Error> {
    self.transition(FlowNodeStatus::Processed)
  }

  pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), Error> {
    self.transition(FlowNodeStatus::Failed)?;
    self.error = Some(error.into());
    Ok(())
  }

  pub fn mark_rejected(&mut self) -> Result<(), Error> {
    self.transition(FlowNodeStatus::Rejected)
  }

  /// Forward-only status change. Terminal statuses clear the deferred flag.
  fn transition(&mut self, to: FlowNodeStatus) -> Result<(), Error> {
    let allowed = match self.status {
      FlowNodeStatus::Pending | FlowNodeStatus::Standby => to != FlowNodeStatus::Pending,
      _ => false,
    };
    if !allowed {
      return Err(Error::InvalidTransition {
        flow_node_id: self.id.clone(),
        from: self.status,
        to,
      });
    }

    self.status = to;
    if to.is_terminal() {
      self.is_deferred = false;
      self.processed_at = Some(Utc::now());
    }
    Ok(())
  }
}

/// Reference to a business entity by type and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
  pub entity_type: String,
  pub id: String,
}

impl EntityRef {
  pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: id.into(),
    }
  }
}

/// A generic business record keyed by type and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
  pub entity_type: String,
  pub id: String,
  /// Attribute object, e.g. `{"status": "Open", "amount": 120}`.
  pub attributes: Json<serde_json::Value>,
  /// Named one-level relations, e.g. `account -> Account/a-1`.
  #[serde(default)]
  pub links: Json<BTreeMap<String, EntityRef>>,
  #[serde(default = "Utc::now")]
  pub modified_at: DateTime<Utc>,
}

impl Entity {
  pub fn new(
    entity_type: impl Into<String>,
    id: impl Into<String>,
    attributes: serde_json::Value,
  ) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: id.into(),
      attributes: Json(attributes),
      links: Json(BTreeMap::new()),
      modified_at: Utc::now(),
    }
  }

  pub fn with_link(
    mut self,
    name: impl Into<String>,
    entity_type: impl Into<String>,
    id: impl Into<String>,
  ) -> Self {
    self.links.0.insert(name.into(), EntityRef::new(entity_type, id));
    self
  }

  pub fn entity_ref(&self) -> EntityRef {
    EntityRef::new(&self.entity_type, &self.id)
  }

  /// Read a single attribute.
  pub fn get(&self, attribute: &str) -> Option<&serde_json::Value> {
    self.attributes.0.get(attribute)
  }

  /// Set a single attribute, turning a non-object attribute value into an object.
  pub fn set(&mut self, attribute: impl Into<String>, value: serde_json::Value) {
    if !self.attributes.0.is_object() {
      self.attributes.0 = serde_json::Value::Object(Default::default());
    }
    if let Some(map) = self.attributes.0.as_object_mut() {
      map.insert(attribute.into(), value);
    }
  }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use trellis_config::ElementType;

  fn node() -> FlowNode {
    FlowNode::new("p-1", &ElementDef::new("gw", ElementType::EndEvent), 1)
  }

  #[test]
  fn test_forward_transitions() {
    let mut n = node();
    n.mark_standby().unwrap();
    n.mark_standby().unwrap();
    n.mark_processed().unwrap();
    assert_eq!(n.status, FlowNodeStatus::Processed);
    assert!(n.processed_at.is_some());
  }

  #[test]
  fn test_terminal_status_is_final() {
    let mut n = node();
    n.mark_failed("boom").unwrap();
    assert_eq!(n.error.as_deref(), Some("boom"));

    let err = n.mark_processed().unwrap_err();
    assert!(matches!(
      err,
      Error::InvalidTransition {
        from: FlowNodeStatus::Failed,
        to: FlowNodeStatus::Processed,
        ..
      }
    ));
    assert!(n.mark_rejected().is_err());
  }

  #[test]
  fn test_terminal_status_clears_deferred() {
    let mut n = node();
    n.defer_on(&EntityRef::new("Case", "c-1"));
    assert!(!n.is_actionable());

    n.mark_rejected().unwrap();
    assert!(!n.is_deferred);
    assert_eq!(n.target_id.as_deref(), Some("c-1"));
  }

  #[test]
  fn test_entity_attribute_access() {
    let mut entity = Entity::new("Case", "c-1", json!({ "status": "Open" }))
      .with_link("account", "Account", "a-1");
    entity.set("priority", json!("High"));

    assert_eq!(entity.get("status"), Some(&json!("Open")));
    assert_eq!(entity.get("priority"), Some(&json!("High")));
    assert_eq!(entity.links.0["account"], EntityRef::new("Account", "a-1"));
  }
}
