use thiserror::Error;
use trellis_action::ActionError;
use trellis_condition::ConditionError;
use trellis_definition::DefinitionError;

/// Errors surfaced by the engine.
///
/// Two classes matter to callers: configuration errors (the definition or
/// payload as authored cannot work, never retried) and everything else,
/// mostly persistence failures the job framework may retry.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The process does not exist or has been removed.
  #[error("process not found: {0}")]
  ProcessNotFound(String),

  /// No definition is registered under the name.
  #[error("definition not found: {0}")]
  DefinitionNotFound(String),

  /// A process definition failed validation.
  #[error("invalid definition: {0}")]
  Definition(#[from] DefinitionError),

  #[error(transparent)]
  Condition(#[from] ConditionError),

  #[error(transparent)]
  Action(#[from] ActionError),

  /// A process-level configuration problem not covered by the above.
  #[error("process '{process_id}': {message}")]
  Configuration { process_id: String, message: String },

  /// A sub-process was removed before it ended.
  #[error("process '{process_id}': sub-process '{sub_process_id}' was removed before it ended")]
  SubProcessRemoved {
    process_id: String,
    sub_process_id: String,
  },

  /// A job that cannot be run as enqueued.
  #[error("job '{job_id}': {message}")]
  InvalidJob { job_id: String, message: String },

  /// A storage operation failed.
  #[error("store error: {0}")]
  Store(#[from] trellis_store::Error),
}

impl EngineError {
  /// Whether this is a configuration error. Configuration errors are
  /// reported, not retried.
  pub fn is_configuration(&self) -> bool {
    match self {
      Self::Definition(_)
      | Self::DefinitionNotFound(_)
      | Self::Condition(_)
      | Self::Configuration { .. }
      | Self::InvalidJob { .. } => true,
      Self::Action(e) => e.is_configuration(),
      Self::ProcessNotFound(_) | Self::SubProcessRemoved { .. } | Self::Store(_) => false,
    }
  }

  /// Store lookups that miss become [`EngineError::ProcessNotFound`].
  pub(crate) fn from_process_lookup(process_id: &str, error: trellis_store::Error) -> Self {
    match error {
      trellis_store::Error::NotFound(_) => Self::ProcessNotFound(process_id.to_string()),
      other => Self::Store(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classification() {
    let unknown_subject = EngineError::from(ConditionError::UnknownSubjectType {
      process_id: "p-1".to_string(),
      subject_type: "soon".to_string(),
    });
    assert!(unknown_subject.is_configuration());
    assert!(unknown_subject.to_string().contains("p-1"));

    let send_failed = EngineError::from(ActionError::Execution {
      action_type: "sendEmail".to_string(),
      message: "timeout".to_string(),
    });
    assert!(!send_failed.is_configuration());

    let missing = EngineError::from_process_lookup(
      "p-2",
      trellis_store::Error::NotFound("process 'p-2'".to_string()),
    );
    assert!(matches!(missing, EngineError::ProcessNotFound(id) if id == "p-2"));
  }
}
