use async_trait::async_trait;

use crate::error::ActionError;

/// A resolved action, handed to its handler.
#[derive(Debug, Clone)]
pub struct ActionRequest {
  pub process_id: String,
  pub flow_node_id: String,
  pub element_id: String,
  pub action_type: String,
  /// The payload with every template rendered.
  pub payload: serde_json::Value,
}

/// Implementation of one action type.
///
/// `validate` runs before `execute` and must not have side effects; its
/// errors are configuration errors.
#[async_trait]
pub trait ActionHandler: Send + Sync {
  fn validate(&self, _request: &ActionRequest) -> Result<(), ActionError> {
    Ok(())
  }

  /// Perform the side effect. The returned value is recorded on the flow
  /// node.
  async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError>;
}

/// Writes the rendered `message` field to the log.
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
  fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
    match request.payload.get("message").and_then(|m| m.as_str()) {
      Some(_) => Ok(()),
      None => Err(ActionError::MissingField {
        process_id: request.process_id.clone(),
        action_type: request.action_type.clone(),
        field: "message".to_string(),
      }),
    }
  }

  async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value, ActionError> {
    let message = request
      .payload
      .get("message")
      .and_then(|m| m.as_str())
      .unwrap_or_default();
    tracing::info!(
      process_id = %request.process_id,
      element_id = %request.element_id,
      message,
      "process_log"
    );
    Ok(serde_json::json!({ "logged": message }))
  }
}
