//! Flow advancement.
//!
//! ```text
//!   advance_process(id)
//!     └── lock ──► pass ──► for each actionable node (sequence order)
//!                   ▲          ├── startEvent / endEvent ─► PROCESSED
//!                   │          ├── task ──────────────────► dispatch ─► PROCESSED | FAILED
//!                   │          ├── gateway ───────────────► evaluate ─► true / false edge | STANDBY
//!                   │          ├── wait ──────────────────► evaluate ─► PROCESSED | STANDBY
//!                   │          └── subProcess ────────────► spawn child ─► STANDBY until child ends
//!                   └── repeat while a pass changed something
//!              ──► ended when every node is terminal ──► unlock
//! ```
//!
//! Nothing here is transactional across the graph: a failed node does not
//! undo the nodes processed before it, and sibling branches keep going.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::FixedOffset;
use serde_json::{Value, json};
use tracing::instrument;
use trellis_action::{ActionContext, ActionDispatcher};
use trellis_condition::{ConditionEvaluator, EvaluationContext, parse_time_zone, required_links};
use trellis_config::{ConditionDef, ElementDef, ElementType, EngineSettings, ProcessDef};
use trellis_definition::ProcessDefinition;
use trellis_store::{
  Entity, EntityRef, FlowNode, FlowNodeStatus, Process, ProcessStatus, Store, now_millis,
};

use crate::error::EngineError;
use crate::events::{ProcessEvent, ProcessNotifier};
use crate::lock::LockManager;

/// Entity type under which processes are referenced as flow node targets.
pub const PROCESS_ENTITY_TYPE: &str = "Process";

/// Key of the spawned child id in a sub-process node's data.
const SUB_PROCESS_ID: &str = "subProcessId";

/// Outcome of advancing one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
  /// Another worker holds the lock; try again on a later sweep.
  Busy,
  Advanced(AdvanceReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceReport {
  /// Status changes plus nodes created.
  pub transitions: usize,
  /// The process reached `ended` in this invocation.
  pub ended: bool,
  /// The process was removed while it was being advanced.
  pub removed: bool,
}

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub advanced: usize,
  pub busy: usize,
  pub transitions: usize,
  pub ended: usize,
}

/// Walks locked processes through their definitions.
#[derive(Clone)]
pub struct FlowAdvancer {
  store: Arc<dyn Store>,
  locks: LockManager,
  conditions: Arc<ConditionEvaluator>,
  actions: Arc<ActionDispatcher>,
  notifier: Arc<dyn ProcessNotifier>,
  max_passes: usize,
  batch_size: u32,
  time_zone: FixedOffset,
}

impl FlowAdvancer {
  pub fn new(
    store: Arc<dyn Store>,
    locks: LockManager,
    conditions: Arc<ConditionEvaluator>,
    actions: Arc<ActionDispatcher>,
    notifier: Arc<dyn ProcessNotifier>,
    settings: &EngineSettings,
  ) -> Result<Self, EngineError> {
    Ok(Self {
      store,
      locks,
      conditions,
      actions,
      notifier,
      max_passes: settings.max_passes_per_advance.max(1),
      batch_size: u32::try_from(settings.deferred_batch_size).unwrap_or(u32::MAX),
      time_zone: parse_time_zone(&settings.time_zone)?,
    })
  }

  /// Create the start nodes of a `created` process and mark it `started`.
  ///
  /// Returns false when the process had already been started or is busy.
  #[instrument(skip(self))]
  pub async fn start_process(&self, process_id: &str) -> Result<bool, EngineError> {
    let started = self
      .locks
      .with_lock(process_id, |mut process| async move {
        if process.status != ProcessStatus::Created {
          return Ok(false);
        }
        let definition = ProcessDefinition::new(process.definition.0.clone())?;
        self.start_unlocked(&mut process, &definition).await?;
        Ok(true)
      })
      .await?;
    Ok(started.unwrap_or(false))
  }

  /// Lock a process, advance it until nothing moves, and release it.
  #[instrument(skip(self))]
  pub async fn advance_process(&self, process_id: &str) -> Result<AdvanceOutcome, EngineError> {
    let advanced = self
      .locks
      .with_lock(process_id, |process| self.advance_locked(process))
      .await?;
    Ok(advanced.map_or(AdvanceOutcome::Busy, AdvanceOutcome::Advanced))
  }

  /// Advance every process with actionable work, optionally limited to the
  /// tree rooted at `scope`.
  ///
  /// Busy processes are skipped. Rounds repeat while they make progress so
  /// a parent waiting on a child that just ended moves in the same sweep.
  #[instrument(skip(self))]
  pub async fn advance_all_pending(&self, scope: Option<&str>) -> Result<SweepReport, EngineError> {
    self.locks.recover_stale(now_millis()).await?;

    let mut report = SweepReport::default();
    for _ in 0..self.max_passes {
      let pending = self.store.list_pending_processes(scope).await?;
      let mut transitions = 0;

      for process in pending {
        match self.advance_process(&process.id).await {
          Ok(AdvanceOutcome::Busy) => report.busy += 1,
          Ok(AdvanceOutcome::Advanced(advanced)) => {
            report.advanced += 1;
            transitions += advanced.transitions;
            if advanced.ended {
              report.ended += 1;
            }
          }
          // Removed since it was listed.
          Err(EngineError::ProcessNotFound(_)) => {}
          Err(e) => return Err(e),
        }
      }

      report.transitions += transitions;
      if transitions == 0 {
        break;
      }
    }

    tracing::debug!(
      scope = scope.unwrap_or("*"),
      advanced = report.advanced,
      busy = report.busy,
      transitions = report.transitions,
      "sweep_completed"
    );
    Ok(report)
  }

  async fn start_unlocked(
    &self,
    process: &mut Process,
    definition: &ProcessDefinition,
  ) -> Result<(), EngineError> {
    for (sequence, element) in (1..).zip(definition.start_elements()) {
      self.activate(process, element, None, sequence).await?;
    }

    process.status = ProcessStatus::Started;
    self.store.update_process(process).await?;

    tracing::info!(process_id = %process.id, name = %process.name, "process_started");
    self.notifier.notify(ProcessEvent::ProcessStarted {
      process_id: process.id.clone(),
      name: process.name.clone(),
    });
    Ok(())
  }

  async fn advance_locked(&self, mut process: Process) -> Result<AdvanceReport, EngineError> {
    let mut report = AdvanceReport::default();
    if process.status != ProcessStatus::Started {
      return Ok(report);
    }
    let definition = ProcessDefinition::new(process.definition.0.clone())?;

    for _ in 0..self.max_passes {
      let nodes = self.store.list_flow_nodes(&process.id).await?;
      let mut next_sequence = nodes.iter().map(|n| n.sequence).max().unwrap_or(0) + 1;
      let mut changed = 0;

      for node in nodes.into_iter().filter(FlowNode::is_actionable) {
        // The node in flight is never preempted; removal stops the next one.
        if self.store.find_process(&process.id).await?.is_none() {
          tracing::info!(process_id = %process.id, "process_removed_during_advance");
          report.removed = true;
          return Ok(report);
        }
        match self
          .advance_node(&process, &definition, node, &mut next_sequence)
          .await
        {
          Ok(transitions) => changed += transitions,
          Err(e) => {
            // Removed while the node ran: the store refused to overwrite the
            // rejected node or to add successors.
            if self.store.find_process(&process.id).await?.is_none() {
              tracing::info!(process_id = %process.id, error = %e, "process_removed_during_advance");
              report.removed = true;
              return Ok(report);
            }
            return Err(e);
          }
        }
      }

      report.transitions += changed;
      if changed == 0 {
        break;
      }
    }

    report.ended = self.end_if_complete(&mut process).await?;
    Ok(report)
  }

  async fn advance_node(
    &self,
    process: &Process,
    definition: &ProcessDefinition,
    node: FlowNode,
    next_sequence: &mut i64,
  ) -> Result<usize, EngineError> {
    tracing::trace!(
      process_id = %process.id,
      flow_node_id = %node.id,
      element_id = %node.element_id,
      element_type = %node.element_type,
      "advancing_flow_node"
    );

    let element = node.element_data.0.clone();
    match &element.element_type {
      ElementType::StartEvent | ElementType::EndEvent => {
        self
          .complete(process, definition, node, None, Value::Null, next_sequence)
          .await
      }

      ElementType::Task { action } => {
        let ctx = self.action_context(process, &node).await?;
        match self.actions.dispatch(&ctx, action).await {
          Ok(output) => {
            self
              .complete(process, definition, node, None, output, next_sequence)
              .await
          }
          Err(e) => self.fail(process, node, &EngineError::from(e)).await,
        }
      }

      ElementType::Gateway { condition } => {
        let target = process.target();
        let seen = self.load_target(target.as_ref()).await?;
        match self.evaluate(process, condition, seen.clone()).await {
          Ok(true) => {
            self
              .complete(process, definition, node, Some(true), Value::Null, next_sequence)
              .await
          }
          Ok(false) if definition.has_alternate(&node.element_id) => {
            self
              .complete(process, definition, node, Some(false), Value::Null, next_sequence)
              .await
          }
          Ok(false) => self.stall_on_entity(process, node, target, seen).await,
          Err(e) if e.is_configuration() => self.fail(process, node, &e).await,
          Err(e) => Err(e),
        }
      }

      ElementType::Wait { condition, .. } => {
        let target = node_target(&node);
        let Some(condition) = condition else {
          return self
            .complete(process, definition, node, None, Value::Null, next_sequence)
            .await;
        };
        let seen = self.load_target(target.as_ref()).await?;
        match self.evaluate(process, condition, seen.clone()).await {
          Ok(true) => {
            self
              .complete(process, definition, node, None, Value::Null, next_sequence)
              .await
          }
          Ok(false) => self.stall_on_entity(process, node, target, seen).await,
          Err(e) if e.is_configuration() => self.fail(process, node, &e).await,
          Err(e) => Err(e),
        }
      }

      ElementType::SubProcess { definition: child } => {
        self
          .advance_sub_process(process, definition, node, child, next_sequence)
          .await
      }
    }
  }

  /// Spawn the child on first visit; afterwards wait for it to end.
  async fn advance_sub_process(
    &self,
    process: &Process,
    definition: &ProcessDefinition,
    node: FlowNode,
    child_def: &ProcessDef,
    next_sequence: &mut i64,
  ) -> Result<usize, EngineError> {
    let Some(child_id) = node
      .data
      .0
      .get(SUB_PROCESS_ID)
      .and_then(Value::as_str)
      .map(str::to_string)
    else {
      return self.spawn_sub_process(process, node, child_def).await;
    };

    match self.store.get_process(&child_id).await {
      Ok(child) if child.status == ProcessStatus::Ended => {
        let output = json!({ SUB_PROCESS_ID: child_id });
        self
          .complete(process, definition, node, None, output, next_sequence)
          .await
      }
      Ok(child) if !child.deleted && child.status != ProcessStatus::Interrupted => {
        let node_id = node.id.clone();
        let target = EntityRef::new(PROCESS_ENTITY_TYPE, &child_id);
        let transitions = self.stall(process, node, Some(target)).await?;

        // A child that ended before the deferral landed cleared nothing.
        let current = self.store.get_process(&child_id).await?;
        if current.status != child.status || current.deleted {
          return Ok(transitions + self.undefer(process, &node_id).await?);
        }
        Ok(transitions)
      }
      Ok(_) | Err(trellis_store::Error::NotFound(_)) => {
        let error = EngineError::SubProcessRemoved {
          process_id: process.id.clone(),
          sub_process_id: child_id,
        };
        self.fail(process, node, &error).await
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn spawn_sub_process(
    &self,
    process: &Process,
    mut node: FlowNode,
    child_def: &ProcessDef,
  ) -> Result<usize, EngineError> {
    let child_definition = ProcessDefinition::new(child_def.clone())?;
    let mut child = Process::new(child_def.clone())
      .with_parent(&process.id, &node.id)
      .with_variables(process.variables.0.clone());
    if let Some(target) = process.target() {
      child = child.with_target(target.entity_type, target.id);
    }
    self.store.create_process(&child).await?;

    // Deferred on the child before the child can run, so its end always
    // finds this node.
    if let Some(data) = node.data.0.as_object_mut() {
      data.insert(SUB_PROCESS_ID.to_string(), Value::String(child.id.clone()));
    }
    node.mark_standby()?;
    node.defer_on(&EntityRef::new(PROCESS_ENTITY_TYPE, &child.id));
    if let Err(e) = self.store.update_flow_node(&node).await {
      // The node was rejected meanwhile; nothing would ever remove the child.
      self.store.mark_process_deleted(&child.id).await?;
      return Err(e.into());
    }
    self.notify_standby(process, &node);

    tracing::info!(
      process_id = %process.id,
      flow_node_id = %node.id,
      sub_process_id = %child.id,
      "sub_process_spawned"
    );
    self.start_unlocked(&mut child, &child_definition).await?;
    Ok(1)
  }

  /// PROCESSED, then activate the successors for `outcome`.
  async fn complete(
    &self,
    process: &Process,
    definition: &ProcessDefinition,
    mut node: FlowNode,
    outcome: Option<bool>,
    output: Value,
    next_sequence: &mut i64,
  ) -> Result<usize, EngineError> {
    let successors = definition.successors(&node.element_id, outcome)?;

    if !output.is_null()
      && let Some(data) = node.data.0.as_object_mut()
    {
      data.insert("output".to_string(), output.clone());
    }
    node.mark_processed()?;
    self.store.update_flow_node(&node).await?;

    tracing::debug!(
      process_id = %process.id,
      flow_node_id = %node.id,
      element_id = %node.element_id,
      outcome = ?outcome,
      successors = successors.len(),
      "flow_node_processed"
    );
    self.notifier.notify(ProcessEvent::FlowNodeProcessed {
      process_id: process.id.clone(),
      flow_node_id: node.id.clone(),
      element_id: node.element_id.clone(),
      output,
    });

    let mut transitions = 1;
    for element in successors {
      self
        .activate(process, element, Some(&node), *next_sequence)
        .await?;
      *next_sequence += 1;
      transitions += 1;
    }
    Ok(transitions)
  }

  /// FAILED with the error text. The branch stops here.
  async fn fail(
    &self,
    process: &Process,
    mut node: FlowNode,
    error: &EngineError,
  ) -> Result<usize, EngineError> {
    let message = error.to_string();
    node.mark_failed(&message)?;
    self.store.update_flow_node(&node).await?;

    tracing::error!(
      process_id = %process.id,
      flow_node_id = %node.id,
      element_id = %node.element_id,
      configuration = error.is_configuration(),
      error = %message,
      "flow_node_failed"
    );
    self.notifier.notify(ProcessEvent::FlowNodeFailed {
      process_id: process.id.clone(),
      flow_node_id: node.id.clone(),
      element_id: node.element_id.clone(),
      error: message,
    });
    Ok(1)
  }

  /// STANDBY, deferred on `target` when there is one. A node without a
  /// target is re-evaluated on every sweep.
  async fn stall(
    &self,
    process: &Process,
    mut node: FlowNode,
    target: Option<EntityRef>,
  ) -> Result<usize, EngineError> {
    let entered = node.status != FlowNodeStatus::Standby;
    if entered {
      node.mark_standby()?;
    }
    if let Some(target) = &target {
      node.defer_on(target);
    }
    if entered || target.is_some() {
      self.store.update_flow_node(&node).await?;
    }

    if entered {
      self.notify_standby(process, &node);
    }
    Ok(usize::from(entered))
  }

  /// [`stall`](Self::stall) on `target`, then re-read it. A save that landed
  /// between the read in `seen` and the deferral found nothing to clear, so
  /// the node is made actionable again.
  async fn stall_on_entity(
    &self,
    process: &Process,
    node: FlowNode,
    target: Option<EntityRef>,
    seen: Option<Entity>,
  ) -> Result<usize, EngineError> {
    let Some(target_ref) = target.clone() else {
      return self.stall(process, node, None).await;
    };
    let node_id = node.id.clone();
    let transitions = self.stall(process, node, target).await?;

    if self.load_target(Some(&target_ref)).await? != seen {
      return Ok(transitions + self.undefer(process, &node_id).await?);
    }
    Ok(transitions)
  }

  /// Clear `is_deferred` on a STANDBY node so the next pass re-evaluates it.
  async fn undefer(&self, process: &Process, flow_node_id: &str) -> Result<usize, EngineError> {
    let mut node = self.store.get_flow_node(flow_node_id).await?;
    if !node.is_deferred || node.status.is_terminal() {
      return Ok(0);
    }
    node.is_deferred = false;
    self.store.update_flow_node(&node).await?;

    tracing::debug!(
      process_id = %process.id,
      flow_node_id = %node.id,
      "flow_node_target_changed"
    );
    Ok(1)
  }

  async fn load_target(&self, target: Option<&EntityRef>) -> Result<Option<Entity>, EngineError> {
    match target {
      Some(target) => Ok(
        self
          .store
          .find_entity(&target.entity_type, &target.id)
          .await?,
      ),
      None => Ok(None),
    }
  }

  /// Create a PENDING node for `element`. Wait nodes are created deferred
  /// on their target.
  async fn activate(
    &self,
    process: &Process,
    element: &ElementDef,
    previous: Option<&FlowNode>,
    sequence: i64,
  ) -> Result<(), EngineError> {
    let mut node = FlowNode::new(&process.id, element, sequence);
    if let Some(previous) = previous {
      node = node.with_previous(&previous.id);
    }

    let mut misconfigured = None;
    if let ElementType::Wait {
      target_type,
      target_id,
      ..
    } = &element.element_type
    {
      match wait_target(process, target_type.as_deref(), target_id.as_deref()) {
        Some(target) => node.defer_on(&target),
        None => {
          let error = EngineError::Configuration {
            process_id: process.id.clone(),
            message: format!("wait element '{}' has no target to wait on", element.element_id),
          };
          node.mark_failed(error.to_string())?;
          misconfigured = Some(error);
        }
      }
    }

    self.store.create_flow_node(&node).await?;
    tracing::debug!(
      process_id = %process.id,
      flow_node_id = %node.id,
      element_id = %node.element_id,
      deferred = node.is_deferred,
      "flow_node_created"
    );
    self.notifier.notify(ProcessEvent::FlowNodeCreated {
      process_id: process.id.clone(),
      flow_node_id: node.id.clone(),
      element_id: node.element_id.clone(),
    });

    if let Some(error) = misconfigured {
      tracing::error!(process_id = %process.id, flow_node_id = %node.id, error = %error, "flow_node_failed");
      self.notifier.notify(ProcessEvent::FlowNodeFailed {
        process_id: process.id.clone(),
        flow_node_id: node.id,
        element_id: node.element_id,
        error: error.to_string(),
      });
    }
    Ok(())
  }

  /// Mark the process ended once every node is terminal. An ended child
  /// reactivates the parent node waiting on it.
  async fn end_if_complete(&self, process: &mut Process) -> Result<bool, EngineError> {
    let nodes = self.store.list_flow_nodes(&process.id).await?;
    if nodes.is_empty() || !nodes.iter().all(|n| n.status.is_terminal()) {
      return Ok(false);
    }
    if self.store.find_process(&process.id).await?.is_none() {
      return Ok(false);
    }

    process.status = ProcessStatus::Ended;
    self.store.update_process(process).await?;

    let failed = nodes
      .iter()
      .filter(|n| n.status == FlowNodeStatus::Failed)
      .count();
    tracing::info!(process_id = %process.id, nodes = nodes.len(), failed, "process_ended");
    self.notifier.notify(ProcessEvent::ProcessEnded {
      process_id: process.id.clone(),
    });

    if !process.is_root() {
      let cleared = self
        .store
        .clear_deferred(PROCESS_ENTITY_TYPE, &process.id, self.batch_size)
        .await?;
      if !cleared.is_empty() {
        self.notifier.notify(ProcessEvent::FlowNodesReactivated {
          target_type: PROCESS_ENTITY_TYPE.to_string(),
          target_id: process.id.clone(),
          flow_node_ids: cleared,
        });
      }
    }
    Ok(true)
  }

  /// Evaluate a condition against the target entity, its linked entities
  /// and the process variables.
  async fn evaluate(
    &self,
    process: &Process,
    condition: &ConditionDef,
    entity: Option<Entity>,
  ) -> Result<bool, EngineError> {
    let (attributes, linked) = condition_inputs(self.store.as_ref(), entity, condition).await?;

    let ctx = EvaluationContext::new(&process.id, &attributes, &linked, &process.variables.0)
      .in_time_zone(self.time_zone);
    Ok(self.conditions.evaluate(condition, &ctx)?)
  }

  /// Template context `{ target, variables, process }` for a task.
  async fn action_context(&self, process: &Process, node: &FlowNode) -> Result<ActionContext, EngineError> {
    let mut target = Value::Null;
    if let Some(target_ref) = process.target()
      && let Some(entity) = self
        .store
        .find_entity(&target_ref.entity_type, &target_ref.id)
        .await?
    {
      target = entity.attributes.0;
      if let Some(map) = target.as_object_mut() {
        map.entry("id").or_insert_with(|| Value::String(entity.id.clone()));
        map
          .entry("entityType")
          .or_insert_with(|| Value::String(entity.entity_type.clone()));
      }
    }

    Ok(ActionContext {
      process_id: process.id.clone(),
      flow_node_id: node.id.clone(),
      element_id: node.element_id.clone(),
      template_context: json!({
        "target": target,
        "variables": process.variables.0,
        "process": {
          "id": process.id,
          "name": process.name,
          "targetType": process.target_type,
          "targetId": process.target_id,
        },
      }),
    })
  }

  fn notify_standby(&self, process: &Process, node: &FlowNode) {
    tracing::debug!(
      process_id = %process.id,
      flow_node_id = %node.id,
      element_id = %node.element_id,
      deferred = node.is_deferred,
      "flow_node_standby"
    );
    self.notifier.notify(ProcessEvent::FlowNodeStandby {
      process_id: process.id.clone(),
      flow_node_id: node.id.clone(),
      element_id: node.element_id.clone(),
    });
  }
}

/// Attributes of `entity` plus the attributes of every linked entity the
/// condition reads through.
pub(crate) async fn condition_inputs(
  store: &dyn Store,
  entity: Option<Entity>,
  condition: &ConditionDef,
) -> Result<(Value, HashMap<String, Value>), EngineError> {
  let Some(entity) = entity else {
    return Ok((Value::Null, HashMap::new()));
  };

  let mut linked = HashMap::new();
  for link in required_links(condition.field_paths()) {
    let Some(link_ref) = entity.links.0.get(link) else {
      continue;
    };
    if let Some(related) = store
      .find_entity(&link_ref.entity_type, &link_ref.id)
      .await?
    {
      linked.insert(link.to_string(), related.attributes.0);
    }
  }
  Ok((entity.attributes.0, linked))
}

/// The element target when both halves are given, the process target when
/// neither is.
fn wait_target(
  process: &Process,
  target_type: Option<&str>,
  target_id: Option<&str>,
) -> Option<EntityRef> {
  match (target_type, target_id) {
    (Some(entity_type), Some(id)) => Some(EntityRef::new(entity_type, id)),
    (None, None) => process.target(),
    _ => None,
  }
}

fn node_target(node: &FlowNode) -> Option<EntityRef> {
  match (&node.target_type, &node.target_id) {
    (Some(entity_type), Some(id)) => Some(EntityRef::new(entity_type, id)),
    _ => None,
  }
}
