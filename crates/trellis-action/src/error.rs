use thiserror::Error;

/// Errors that can occur while dispatching an action.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
  /// The payload has no `type` tag.
  #[error("process '{process_id}': action on element '{element_id}' has no type")]
  MissingType {
    process_id: String,
    element_id: String,
  },

  /// No handler is registered for the action type.
  #[error("process '{process_id}': no handler for action type '{action_type}'")]
  UnknownActionType {
    process_id: String,
    action_type: String,
  },

  /// A required payload field is absent or empty.
  #[error("process '{process_id}': {action_type} action is missing '{field}'")]
  MissingField {
    process_id: String,
    action_type: String,
    field: String,
  },

  /// A payload field has an unusable value.
  #[error("process '{process_id}': invalid '{field}' in {action_type} action: {message}")]
  InvalidField {
    process_id: String,
    action_type: String,
    field: String,
    message: String,
  },

  /// A payload template failed to render.
  #[error("process '{process_id}': failed to render '{field}': {message}")]
  Template {
    process_id: String,
    field: String,
    message: String,
  },

  /// The handler ran and failed.
  #[error("{action_type} action failed: {message}")]
  Execution { action_type: String, message: String },
}

impl ActionError {
  /// Configuration errors come from the payload as authored; only
  /// [`ActionError::Execution`] comes from running it.
  pub fn is_configuration(&self) -> bool {
    !matches!(self, Self::Execution { .. })
  }
}
