use serde::{Deserialize, Serialize};

/// Which gateway outcome a sequence flow belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
  /// Taken unconditionally (and as a `true` edge when leaving a gateway).
  #[default]
  Always,
  True,
  False,
}

/// A directed sequence flow between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
  pub from: String,
  pub to: String,
  #[serde(default, skip_serializing_if = "is_always")]
  pub branch: Branch,
}

fn is_always(branch: &Branch) -> bool {
  *branch == Branch::Always
}

impl FlowDef {
  pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
    Self::with_branch(from, to, Branch::Always)
  }

  pub fn with_branch(from: impl Into<String>, to: impl Into<String>, branch: Branch) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
      branch,
    }
  }
}
