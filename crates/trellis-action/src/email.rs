//! The `sendEmail` action.
//!
//! ```json
//! {
//!   "type": "sendEmail",
//!   "from": "system",
//!   "to": "specifiedContacts",
//!   "toSpecifiedEntityIds": ["c-1", "c-2"],
//!   "cc": "specifiedEmailAddress",
//!   "ccEmailAddress": "audit@example.com",
//!   "emailTemplateId": "tpl-welcome",
//!   "processImmediately": true
//! }
//! ```
//!
//! Delivery is out of scope here: the handler validates the payload into an
//! [`EmailAction`] and passes it to an injected [`EmailSender`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ActionError;
use crate::handler::{ActionHandler, ActionRequest};

pub const SEND_EMAIL: &str = "sendEmail";

/// Who receives an email, per recipient field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "ids", rename_all = "camelCase")]
pub enum Recipients {
  /// The process target itself (e.g. a contact or lead).
  TargetEntity,
  SpecifiedContacts(Vec<String>),
  SpecifiedUsers(Vec<String>),
  SpecifiedTeams(Vec<String>),
  SpecifiedEmailAddress(String),
}

/// A validated `sendEmail` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAction {
  pub from: Option<String>,
  pub to: Recipients,
  pub cc: Option<Recipients>,
  pub reply_to: Option<Recipients>,
  pub email_template_id: String,
  pub process_immediately: bool,
}

impl EmailAction {
  /// Validate a rendered payload.
  pub fn from_payload(process_id: &str, payload: &Value) -> Result<Self, ActionError> {
    let reader = PayloadReader {
      process_id,
      payload,
    };

    let email_template_id = reader
      .string("emailTemplateId")
      .ok_or_else(|| reader.missing("emailTemplateId"))?
      .to_string();
    let to = reader
      .recipients("to")?
      .ok_or_else(|| reader.missing("to"))?;

    Ok(Self {
      from: reader.string("from").map(str::to_string),
      to,
      cc: reader.recipients("cc")?,
      reply_to: reader.recipients("replyTo")?,
      email_template_id,
      process_immediately: payload
        .get("processImmediately")
        .and_then(Value::as_bool)
        .unwrap_or(false),
    })
  }
}

struct PayloadReader<'a> {
  process_id: &'a str,
  payload: &'a Value,
}

impl PayloadReader<'_> {
  /// A non-empty string field.
  fn string(&self, field: &str) -> Option<&str> {
    self
      .payload
      .get(field)
      .and_then(Value::as_str)
      .filter(|s| !s.trim().is_empty())
  }

  fn missing(&self, field: &str) -> ActionError {
    ActionError::MissingField {
      process_id: self.process_id.to_string(),
      action_type: SEND_EMAIL.to_string(),
      field: field.to_string(),
    }
  }

  fn invalid(&self, field: &str, message: impl Into<String>) -> ActionError {
    ActionError::InvalidField {
      process_id: self.process_id.to_string(),
      action_type: SEND_EMAIL.to_string(),
      field: field.to_string(),
      message: message.into(),
    }
  }

  /// Read `<field>` as a recipient kind plus its companion field.
  fn recipients(&self, field: &str) -> Result<Option<Recipients>, ActionError> {
    let Some(kind) = self.string(field) else {
      return Ok(None);
    };

    let recipients = match kind {
      "targetEntity" => Recipients::TargetEntity,
      "specifiedContacts" => Recipients::SpecifiedContacts(self.entity_ids(field)?),
      "specifiedUsers" => Recipients::SpecifiedUsers(self.entity_ids(field)?),
      "specifiedTeams" => Recipients::SpecifiedTeams(self.entity_ids(field)?),
      "specifiedEmailAddress" => {
        let address_field = format!("{}EmailAddress", field);
        let address = self
          .string(&address_field)
          .ok_or_else(|| self.missing(&address_field))?;
        if !address.contains('@') {
          return Err(self.invalid(&address_field, format!("'{}' is not an email address", address)));
        }
        Recipients::SpecifiedEmailAddress(address.to_string())
      }
      other => return Err(self.invalid(field, format!("unknown recipient kind '{}'", other))),
    };
    Ok(Some(recipients))
  }

  fn entity_ids(&self, field: &str) -> Result<Vec<String>, ActionError> {
    let ids_field = format!("{}SpecifiedEntityIds", field);
    let ids = match self.payload.get(&ids_field) {
      None | Some(Value::Null) => return Err(self.missing(&ids_field)),
      Some(Value::Array(items)) => items
        .iter()
        .map(|item| {
          item
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(&ids_field, "ids must be strings"))
        })
        .collect::<Result<Vec<_>, _>>()?,
      Some(_) => return Err(self.invalid(&ids_field, "expected an array of ids")),
    };

    if ids.is_empty() {
      return Err(self.missing(&ids_field));
    }
    Ok(ids)
  }
}

/// Delivers validated emails. Implemented by the embedding application.
#[async_trait]
pub trait EmailSender: Send + Sync {
  async fn send(&self, request: &ActionRequest, email: &EmailAction) -> Result<(), String>;
}

/// Logs emails instead of sending them.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
  async fn send(&self, request: &ActionRequest, email: &EmailAction) -> Result<(), String> {
    tracing::info!(
      process_id = %request.process_id,
      element_id = %request.element_id,
      template = %email.email_template_id,
      to = ?email.to,
      "email_queued"
    );
    Ok(())
  }
}

/// Handler for [`SEND_EMAIL`].
pub struct SendEmailHandler {
  sender: Arc<dyn EmailSender>,
}

impl SendEmailHandler {
  pub fn new(sender: Arc<dyn EmailSender>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl ActionHandler for SendEmailHandler {
  fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
    EmailAction::from_payload(&request.process_id, &request.payload).map(|_| ())
  }

  async fn execute(&self, request: &ActionRequest) -> Result<Value, ActionError> {
    let email = EmailAction::from_payload(&request.process_id, &request.payload)?;
    self
      .sender
      .send(request, &email)
      .await
      .map_err(|message| ActionError::Execution {
        action_type: SEND_EMAIL.to_string(),
        message,
      })?;

    serde_json::to_value(&email).map_err(|e| ActionError::Execution {
      action_type: SEND_EMAIL.to_string(),
      message: e.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_valid_payload() {
    let email = EmailAction::from_payload(
      "p-1",
      &json!({
        "type": "sendEmail",
        "from": "system",
        "to": "specifiedUsers",
        "toSpecifiedEntityIds": ["u-1"],
        "replyTo": "specifiedEmailAddress",
        "replyToEmailAddress": "ops@example.com",
        "emailTemplateId": "tpl-1",
        "processImmediately": true
      }),
    )
    .unwrap();

    assert_eq!(email.to, Recipients::SpecifiedUsers(vec!["u-1".to_string()]));
    assert_eq!(
      email.reply_to,
      Some(Recipients::SpecifiedEmailAddress("ops@example.com".to_string()))
    );
    assert_eq!(email.cc, None);
    assert!(email.process_immediately);
  }

  #[test]
  fn test_missing_template_is_reported() {
    let err = EmailAction::from_payload("p-1", &json!({ "to": "targetEntity" })).unwrap_err();
    assert!(matches!(&err, ActionError::MissingField { field, .. } if field == "emailTemplateId"));
    assert!(err.is_configuration());
    assert!(err.to_string().contains("p-1"));
  }

  #[test]
  fn test_missing_recipient_kind_is_reported() {
    let err = EmailAction::from_payload("p-1", &json!({ "emailTemplateId": "t" })).unwrap_err();
    assert!(matches!(err, ActionError::MissingField { field, .. } if field == "to"));
  }

  #[test]
  fn test_specified_kinds_require_ids() {
    let err = EmailAction::from_payload(
      "p-1",
      &json!({ "emailTemplateId": "t", "to": "targetEntity", "cc": "specifiedTeams", "ccSpecifiedEntityIds": [] }),
    )
    .unwrap_err();
    assert!(matches!(err, ActionError::MissingField { field, .. } if field == "ccSpecifiedEntityIds"));

    let err = EmailAction::from_payload(
      "p-1",
      &json!({ "emailTemplateId": "t", "to": "specifiedContacts", "toSpecifiedEntityIds": "c-1" }),
    )
    .unwrap_err();
    assert!(matches!(err, ActionError::InvalidField { .. }));
  }

  #[test]
  fn test_unknown_recipient_kind() {
    let err = EmailAction::from_payload("p-1", &json!({ "emailTemplateId": "t", "to": "everyone" }))
      .unwrap_err();
    assert!(matches!(err, ActionError::InvalidField { field, .. } if field == "to"));
  }
}
