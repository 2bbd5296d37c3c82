use std::collections::HashMap;
use std::sync::Arc;

use minijinja::Environment;
use serde_json::Value;

use crate::email::{EmailSender, SEND_EMAIL, SendEmailHandler};
use crate::error::ActionError;
use crate::handler::{ActionHandler, ActionRequest, LogHandler};
use crate::template::render_payload;

/// Where an action runs and what its templates can see.
#[derive(Debug, Clone)]
pub struct ActionContext {
  pub process_id: String,
  pub flow_node_id: String,
  pub element_id: String,
  /// Template context, `{ target, variables, process }`.
  pub template_context: Value,
}

/// Routes declarative action payloads to registered handlers.
pub struct ActionDispatcher {
  handlers: HashMap<String, Arc<dyn ActionHandler>>,
  env: Environment<'static>,
}

impl Default for ActionDispatcher {
  fn default() -> Self {
    Self::new()
  }
}

impl ActionDispatcher {
  /// A dispatcher with no handlers.
  pub fn new() -> Self {
    Self {
      handlers: HashMap::new(),
      env: Environment::new(),
    }
  }

  /// `sendEmail` through `sender`, plus `log`.
  pub fn standard(sender: Arc<dyn EmailSender>) -> Self {
    let mut dispatcher = Self::new();
    dispatcher
      .register(SEND_EMAIL, SendEmailHandler::new(sender))
      .register("log", LogHandler);
    dispatcher
  }

  /// Register a handler for an action type, replacing any previous one.
  pub fn register(
    &mut self,
    action_type: impl Into<String>,
    handler: impl ActionHandler + 'static,
  ) -> &mut Self {
    self.handlers.insert(action_type.into(), Arc::new(handler));
    self
  }

  /// Resolve, validate and execute an action payload.
  ///
  /// Configuration errors surface before the handler runs; see
  /// [`ActionError::is_configuration`].
  pub async fn dispatch(&self, ctx: &ActionContext, payload: &Value) -> Result<Value, ActionError> {
    let action_type = payload
      .get("type")
      .and_then(Value::as_str)
      .filter(|t| !t.is_empty())
      .ok_or_else(|| ActionError::MissingType {
        process_id: ctx.process_id.clone(),
        element_id: ctx.element_id.clone(),
      })?;

    let handler = self
      .handlers
      .get(action_type)
      .ok_or_else(|| ActionError::UnknownActionType {
        process_id: ctx.process_id.clone(),
        action_type: action_type.to_string(),
      })?;

    let request = ActionRequest {
      process_id: ctx.process_id.clone(),
      flow_node_id: ctx.flow_node_id.clone(),
      element_id: ctx.element_id.clone(),
      action_type: action_type.to_string(),
      payload: render_payload(&self.env, &ctx.process_id, payload, &ctx.template_context)?,
    };

    handler.validate(&request)?;

    tracing::debug!(
      process_id = %request.process_id,
      flow_node_id = %request.flow_node_id,
      action_type = %request.action_type,
      "action_dispatched"
    );
    handler.execute(&request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::email::EmailAction;
  use async_trait::async_trait;
  use serde_json::json;
  use tokio::sync::Mutex;

  #[derive(Default)]
  struct RecordingSender {
    sent: Mutex<Vec<EmailAction>>,
    fail: bool,
  }

  #[async_trait]
  impl EmailSender for RecordingSender {
    async fn send(&self, _: &ActionRequest, email: &EmailAction) -> Result<(), String> {
      if self.fail {
        return Err("smtp unavailable".to_string());
      }
      self.sent.lock().await.push(email.clone());
      Ok(())
    }
  }

  fn ctx() -> ActionContext {
    ActionContext {
      process_id: "p-1".to_string(),
      flow_node_id: "fn-1".to_string(),
      element_id: "notify".to_string(),
      template_context: json!({
        "target": { "id": "c-1", "ownerId": "u-9" },
        "variables": {},
        "process": { "id": "p-1" }
      }),
    }
  }

  #[tokio::test]
  async fn test_dispatches_rendered_email() {
    let sender = Arc::new(RecordingSender::default());
    let dispatcher = ActionDispatcher::standard(sender.clone());

    let output = dispatcher
      .dispatch(
        &ctx(),
        &json!({
          "type": "sendEmail",
          "to": "specifiedUsers",
          "toSpecifiedEntityIds": ["{{ target.ownerId }}"],
          "emailTemplateId": "tpl-1"
        }),
      )
      .await
      .unwrap();

    let sent = sender.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(
      sent[0].to,
      crate::email::Recipients::SpecifiedUsers(vec!["u-9".to_string()])
    );
    assert_eq!(output["emailTemplateId"], json!("tpl-1"));
  }

  #[tokio::test]
  async fn test_invalid_payload_never_reaches_sender() {
    let sender = Arc::new(RecordingSender::default());
    let dispatcher = ActionDispatcher::standard(sender.clone());

    let err = dispatcher
      .dispatch(&ctx(), &json!({ "type": "sendEmail", "to": "targetEntity" }))
      .await
      .unwrap_err();

    assert!(err.is_configuration());
    assert!(err.to_string().contains("emailTemplateId"));
    assert!(sender.sent.lock().await.is_empty());
  }

  #[tokio::test]
  async fn test_unknown_and_missing_type() {
    let dispatcher = ActionDispatcher::new();
    assert!(matches!(
      dispatcher.dispatch(&ctx(), &json!({ "type": "sms" })).await,
      Err(ActionError::UnknownActionType { action_type, .. }) if action_type == "sms"
    ));
    assert!(matches!(
      dispatcher.dispatch(&ctx(), &json!({ "to": "x" })).await,
      Err(ActionError::MissingType { .. })
    ));
  }

  #[tokio::test]
  async fn test_sender_failure_is_an_execution_error() {
    let sender = Arc::new(RecordingSender {
      fail: true,
      ..Default::default()
    });
    let dispatcher = ActionDispatcher::standard(sender);

    let err = dispatcher
      .dispatch(
        &ctx(),
        &json!({ "type": "sendEmail", "to": "targetEntity", "emailTemplateId": "t" }),
      )
      .await
      .unwrap_err();
    assert!(!err.is_configuration());
    assert!(err.to_string().contains("smtp unavailable"));
  }
}
