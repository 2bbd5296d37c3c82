use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use trellis_config::ProcessDef;
use trellis_definition::{DefinitionError, ProcessDefinition};

/// Validated definitions by name, for explicit starts and auto-start
/// triggers.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
  definitions: RwLock<BTreeMap<String, Arc<ProcessDefinition>>>,
}

impl DefinitionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Validate and register a definition, replacing any with the same name.
  /// Running processes keep the snapshot they were started with.
  pub fn register(&self, def: ProcessDef) -> Result<Arc<ProcessDefinition>, DefinitionError> {
    let definition = Arc::new(ProcessDefinition::new(def)?);
    let replaced = self
      .definitions
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(definition.name().to_string(), definition.clone())
      .is_some();
    tracing::info!(name = %definition.name(), replaced, "definition_registered");
    Ok(definition)
  }

  pub fn get(&self, name: &str) -> Option<Arc<ProcessDefinition>> {
    self
      .definitions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
  }

  /// Names in sorted order.
  pub fn names(&self) -> Vec<String> {
    self
      .definitions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect()
  }

  /// Definitions with a trigger on `entity_type`.
  pub fn triggered_by(&self, entity_type: &str) -> Vec<Arc<ProcessDefinition>> {
    self
      .definitions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .filter(|d| d.def().trigger.is_some() && d.target_type() == Some(entity_type))
      .cloned()
      .collect()
  }
}
