//! Lifecycle hooks.
//!
//! Hooks run after a record is saved or removed. Their order per event is
//! declared once, in [`HookRegistry::standard`]:
//!
//! ```text
//!   after save:    StartProcess ──► DeferredReactivation ──► AutoStart
//!   after remove:  RejectFlowNodes ──► SubProcessCascade
//! ```
//!
//! Every hook honors the [`SaveOptions`] suppression flags so a save made
//! by the workflow itself never feeds back into the workflow.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use trellis_condition::EvaluationContext;
use trellis_store::{Entity, Process, ProcessStatus};

use crate::advancer::{PROCESS_ENTITY_TYPE, condition_inputs};
use crate::engine::ProcessEngine;
use crate::error::EngineError;
use crate::events::ProcessEvent;

/// Suppression flags carried by a save or remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveOptions {
  /// The save originates from a workflow: no reactivation, no auto-start.
  pub skip_workflow: bool,
  /// A silent save: no reactivation.
  pub silent: bool,
  /// Create the process without starting it.
  pub skip_start_process_flow: bool,
}

/// The record a hook fires for.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
  Process(&'a Process),
  Entity { entity: &'a Entity, is_new: bool },
}

#[async_trait]
pub trait LifecycleHook: Send + Sync {
  /// Name used in logs.
  fn name(&self) -> &'static str;

  async fn after_save(
    &self,
    _engine: &ProcessEngine,
    _record: &Record<'_>,
    _options: &SaveOptions,
  ) -> Result<(), EngineError> {
    Ok(())
  }

  async fn after_remove(
    &self,
    _engine: &ProcessEngine,
    _record: &Record<'_>,
    _options: &SaveOptions,
  ) -> Result<(), EngineError> {
    Ok(())
  }
}

/// Ordered hook lists per lifecycle event.
#[derive(Clone, Default)]
pub struct HookRegistry {
  after_save: Vec<Arc<dyn LifecycleHook>>,
  after_remove: Vec<Arc<dyn LifecycleHook>>,
}

impl HookRegistry {
  /// No hooks.
  pub fn empty() -> Self {
    Self::default()
  }

  /// The engine's hooks in their fixed order.
  pub fn standard() -> Self {
    Self::empty()
      .on_save(StartProcess)
      .on_save(DeferredReactivation)
      .on_save(AutoStart)
      .on_remove(RejectFlowNodes)
      .on_remove(SubProcessCascade)
  }

  /// Append an after-save hook.
  pub fn on_save(mut self, hook: impl LifecycleHook + 'static) -> Self {
    self.after_save.push(Arc::new(hook));
    self
  }

  /// Append an after-remove hook.
  pub fn on_remove(mut self, hook: impl LifecycleHook + 'static) -> Self {
    self.after_remove.push(Arc::new(hook));
    self
  }

  pub fn save_hooks(&self) -> Vec<&'static str> {
    self.after_save.iter().map(|h| h.name()).collect()
  }

  pub fn remove_hooks(&self) -> Vec<&'static str> {
    self.after_remove.iter().map(|h| h.name()).collect()
  }

  /// Run the after-save hooks in order, stopping at the first error.
  pub async fn run_after_save(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    options: &SaveOptions,
  ) -> Result<(), EngineError> {
    for hook in &self.after_save {
      tracing::trace!(hook = hook.name(), "after_save");
      hook.after_save(engine, record, options).await?;
    }
    Ok(())
  }

  /// Run the after-remove hooks in order, stopping at the first error.
  pub async fn run_after_remove(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    options: &SaveOptions,
  ) -> Result<(), EngineError> {
    for hook in &self.after_remove {
      tracing::trace!(hook = hook.name(), "after_remove");
      hook.after_remove(engine, record, options).await?;
    }
    Ok(())
  }
}

/// Starts a newly created process and triggers its first advancement.
pub struct StartProcess;

#[async_trait]
impl LifecycleHook for StartProcess {
  fn name(&self) -> &'static str {
    "start_process"
  }

  async fn after_save(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    options: &SaveOptions,
  ) -> Result<(), EngineError> {
    let Record::Process(process) = record else {
      return Ok(());
    };
    if process.status != ProcessStatus::Created || options.skip_start_process_flow {
      return Ok(());
    }

    if engine.advancer().start_process(&process.id).await? {
      engine.continue_process(&process.id).await?;
    }
    Ok(())
  }
}

/// Clears `is_deferred` on open nodes waiting on a saved entity, up to the
/// configured batch size per save.
///
/// Every qualifying save clears, whether or not the entity changed; the
/// condition is re-evaluated on the next sweep either way.
pub struct DeferredReactivation;

#[async_trait]
impl LifecycleHook for DeferredReactivation {
  fn name(&self) -> &'static str {
    "deferred_reactivation"
  }

  async fn after_save(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    options: &SaveOptions,
  ) -> Result<(), EngineError> {
    let Record::Entity { entity, .. } = record else {
      return Ok(());
    };
    if options.skip_workflow || options.silent {
      return Ok(());
    }

    let cleared = engine
      .store()
      .clear_deferred(&entity.entity_type, &entity.id, engine.batch_size())
      .await?;
    if cleared.is_empty() {
      return Ok(());
    }

    tracing::debug!(
      entity_type = %entity.entity_type,
      entity_id = %entity.id,
      cleared = cleared.len(),
      "flow_nodes_reactivated"
    );

    let mut process_ids = Vec::new();
    for flow_node_id in &cleared {
      let node = engine.store().get_flow_node(flow_node_id).await?;
      if !process_ids.contains(&node.process_id) {
        process_ids.push(node.process_id);
      }
    }

    engine.notifier().notify(ProcessEvent::FlowNodesReactivated {
      target_type: entity.entity_type.clone(),
      target_id: entity.id.clone(),
      flow_node_ids: cleared,
    });

    for process_id in process_ids {
      engine.continue_process(&process_id).await?;
    }
    Ok(())
  }
}

/// Starts processes for saved entities whose registered definition has a
/// matching trigger.
pub struct AutoStart;

#[async_trait]
impl LifecycleHook for AutoStart {
  fn name(&self) -> &'static str {
    "auto_start"
  }

  async fn after_save(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    options: &SaveOptions,
  ) -> Result<(), EngineError> {
    let Record::Entity { entity, is_new } = record else {
      return Ok(());
    };
    if options.skip_workflow {
      return Ok(());
    }

    for definition in engine.definitions().triggered_by(&entity.entity_type) {
      let Some(trigger) = &definition.def().trigger else {
        continue;
      };
      if !trigger.on.matches(*is_new) {
        continue;
      }

      if let Some(condition) = &trigger.condition {
        let (attributes, linked) =
          condition_inputs(engine.store().as_ref(), Some((*entity).clone()), condition).await?;
        let variables = serde_json::Value::Null;
        let ctx = EvaluationContext::new(definition.name(), &attributes, &linked, &variables)
          .at(Utc::now())
          .in_time_zone(engine.time_zone());
        if !engine.conditions().evaluate(condition, &ctx)? {
          continue;
        }
      }

      tracing::info!(
        definition = %definition.name(),
        entity_type = %entity.entity_type,
        entity_id = %entity.id,
        "process_auto_started"
      );
      engine
        .start_process(
          definition.name(),
          Some(entity.entity_ref()),
          serde_json::Value::Object(Default::default()),
          *options,
        )
        .await?;
    }
    Ok(())
  }
}

/// Rejects every open flow node of a removed process.
pub struct RejectFlowNodes;

#[async_trait]
impl LifecycleHook for RejectFlowNodes {
  fn name(&self) -> &'static str {
    "reject_flow_nodes"
  }

  async fn after_remove(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    _options: &SaveOptions,
  ) -> Result<(), EngineError> {
    let Record::Process(process) = record else {
      return Ok(());
    };

    let rejected = engine.store().reject_open_flow_nodes(&process.id).await?;
    if !rejected.is_empty() {
      tracing::info!(process_id = %process.id, rejected = rejected.len(), "flow_nodes_rejected");
      engine.notifier().notify(ProcessEvent::FlowNodesRejected {
        process_id: process.id.clone(),
        flow_node_ids: rejected,
      });
    }

    // A live parent waiting on this process learns it is gone.
    let Some(parent_id) = &process.parent_process_id else {
      return Ok(());
    };
    let woken = engine
      .store()
      .clear_deferred(PROCESS_ENTITY_TYPE, &process.id, engine.batch_size())
      .await?;
    if !woken.is_empty() && engine.store().find_process(parent_id).await?.is_some() {
      engine.continue_process(parent_id).await?;
    }
    Ok(())
  }
}

/// Removes the children of a removed process, recursively.
pub struct SubProcessCascade;

#[async_trait]
impl LifecycleHook for SubProcessCascade {
  fn name(&self) -> &'static str {
    "sub_process_cascade"
  }

  async fn after_remove(
    &self,
    engine: &ProcessEngine,
    record: &Record<'_>,
    options: &SaveOptions,
  ) -> Result<(), EngineError> {
    let Record::Process(process) = record else {
      return Ok(());
    };

    for child in engine.store().list_child_processes(&process.id).await? {
      tracing::debug!(process_id = %process.id, sub_process_id = %child.id, "sub_process_cascade");
      engine.remove_process(&child.id, *options).await?;
    }
    Ok(())
  }
}
