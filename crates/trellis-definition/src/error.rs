use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("element defined more than once: {0}")]
  DuplicateElement(String),

  #[error("element not found: {0}")]
  ElementNotFound(String),

  #[error("flow references unknown element: from={from}, to={to}")]
  InvalidFlow { from: String, to: String },

  #[error("definition '{0}' has no start event")]
  NoStartEvent(String),

  #[error("start event '{0}' has incoming flows")]
  StartEventHasIncoming(String),

  #[error("conditional branch leaves non-gateway element '{from}'")]
  BranchOutsideGateway { from: String },

  #[error("invalid sub-process definition in element '{element_id}'")]
  SubProcess {
    element_id: String,
    #[source]
    source: Box<DefinitionError>,
  },
}
