use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use serde_json::Value;
use tracing::instrument;
use trellis_action::{ActionDispatcher, LogEmailSender};
use trellis_condition::{ConditionEvaluator, parse_time_zone};
use trellis_config::{EngineSettings, ProcessDef};
use trellis_definition::ProcessDefinition;
use trellis_store::{
  Entity, EntityRef, FlowNode, Job, JobKind, JobQueue, Process, ProcessStatus, Store,
};

use crate::advancer::FlowAdvancer;
use crate::definitions::DefinitionRegistry;
use crate::error::EngineError;
use crate::events::{NoopNotifier, ProcessEvent, ProcessNotifier};
use crate::hooks::{HookRegistry, Record, SaveOptions};
use crate::lock::LockManager;
use crate::scheduler::JobScheduler;

/// The process engine: the entry point for starting, saving, removing and
/// continuing processes.
///
/// # Usage
///
/// ```ignore
/// let engine = ProcessEngine::builder(store, queue)
///   .settings(settings)
///   .notifier(Arc::new(SignalBus::new()))
///   .build()?;
///
/// engine.register_definition(def)?;
/// engine.start_process("Follow up", Some(EntityRef::new("Case", "c-1")), json!({}), SaveOptions::default()).await?;
/// ```
pub struct ProcessEngine {
  store: Arc<dyn Store>,
  queue: Arc<dyn JobQueue>,
  settings: EngineSettings,
  time_zone: FixedOffset,
  definitions: DefinitionRegistry,
  conditions: Arc<ConditionEvaluator>,
  notifier: Arc<dyn ProcessNotifier>,
  locks: LockManager,
  advancer: FlowAdvancer,
  scheduler: JobScheduler,
  hooks: HookRegistry,
}

/// Builder for [`ProcessEngine`]. Everything but the store and queue has a
/// default.
pub struct EngineBuilder {
  store: Arc<dyn Store>,
  queue: Arc<dyn JobQueue>,
  settings: EngineSettings,
  conditions: ConditionEvaluator,
  actions: Option<ActionDispatcher>,
  notifier: Arc<dyn ProcessNotifier>,
  hooks: HookRegistry,
}

impl EngineBuilder {
  pub fn settings(mut self, settings: EngineSettings) -> Self {
    self.settings = settings;
    self
  }

  /// Condition evaluator, e.g. with extra comparisons registered.
  pub fn conditions(mut self, conditions: ConditionEvaluator) -> Self {
    self.conditions = conditions;
    self
  }

  /// Action dispatcher. Defaults to the standard handlers with emails
  /// written to the log.
  pub fn actions(mut self, actions: ActionDispatcher) -> Self {
    self.actions = Some(actions);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn ProcessNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn hooks(mut self, hooks: HookRegistry) -> Self {
    self.hooks = hooks;
    self
  }

  pub fn build(self) -> Result<ProcessEngine, EngineError> {
    let time_zone = parse_time_zone(&self.settings.time_zone)?;
    let stale_after = self.settings.lock_stale_after_secs.map(Duration::from_secs);
    let locks = LockManager::new(self.store.clone(), stale_after);
    let conditions = Arc::new(self.conditions);
    let actions = Arc::new(
      self
        .actions
        .unwrap_or_else(|| ActionDispatcher::standard(Arc::new(LogEmailSender))),
    );

    let advancer = FlowAdvancer::new(
      self.store.clone(),
      locks.clone(),
      conditions.clone(),
      actions,
      self.notifier.clone(),
      &self.settings,
    )?;
    let scheduler = JobScheduler::new(
      self.queue.clone(),
      self.store.clone(),
      locks.clone(),
      self.settings.scheduling_mode,
    );

    Ok(ProcessEngine {
      store: self.store,
      queue: self.queue,
      settings: self.settings,
      time_zone,
      definitions: DefinitionRegistry::new(),
      conditions,
      notifier: self.notifier,
      locks,
      advancer,
      scheduler,
      hooks: self.hooks,
    })
  }
}

impl ProcessEngine {
  pub fn builder(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> EngineBuilder {
    EngineBuilder {
      store,
      queue,
      settings: EngineSettings::default(),
      conditions: ConditionEvaluator::new(),
      actions: None,
      notifier: Arc::new(NoopNotifier),
      hooks: HookRegistry::standard(),
    }
  }

  /// An engine with default settings, handlers and hooks.
  pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Result<Self, EngineError> {
    Self::builder(store, queue).build()
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn queue(&self) -> &Arc<dyn JobQueue> {
    &self.queue
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.settings
  }

  pub fn time_zone(&self) -> FixedOffset {
    self.time_zone
  }

  pub fn definitions(&self) -> &DefinitionRegistry {
    &self.definitions
  }

  pub fn conditions(&self) -> &ConditionEvaluator {
    &self.conditions
  }

  pub fn notifier(&self) -> &Arc<dyn ProcessNotifier> {
    &self.notifier
  }

  pub fn locks(&self) -> &LockManager {
    &self.locks
  }

  pub fn advancer(&self) -> &FlowAdvancer {
    &self.advancer
  }

  pub fn scheduler(&self) -> &JobScheduler {
    &self.scheduler
  }

  pub fn hooks(&self) -> &HookRegistry {
    &self.hooks
  }

  /// Maximum deferred nodes reactivated per save.
  pub fn batch_size(&self) -> u32 {
    u32::try_from(self.settings.deferred_batch_size).unwrap_or(u32::MAX)
  }

  /// Validate and register a definition for explicit starts and triggers.
  pub fn register_definition(&self, def: ProcessDef) -> Result<Arc<ProcessDefinition>, EngineError> {
    Ok(self.definitions.register(def)?)
  }

  /// Create a process from a registered definition and start it.
  #[instrument(skip(self, target, variables, options))]
  pub async fn start_process(
    &self,
    definition_name: &str,
    target: Option<EntityRef>,
    variables: Value,
    options: SaveOptions,
  ) -> Result<Process, EngineError> {
    let definition = self
      .definitions
      .get(definition_name)
      .ok_or_else(|| EngineError::DefinitionNotFound(definition_name.to_string()))?;

    let mut process = Process::new(definition.def().clone()).with_variables(variables);
    if let Some(target) = target {
      process = process.with_target(target.entity_type, target.id);
    }
    self.create_process(process, options).await
  }

  /// Persist a new process and run the after-save hooks, which start it
  /// unless `skip_start_process_flow` is set.
  pub async fn create_process(&self, process: Process, options: SaveOptions) -> Result<Process, EngineError> {
    ProcessDefinition::new(process.definition.0.clone())?;
    self.store.create_process(&process).await?;
    tracing::info!(
      process_id = %process.id,
      name = %process.name,
      target_type = ?process.target_type,
      target_id = ?process.target_id,
      "process_created"
    );

    self
      .hooks
      .run_after_save(self, &Record::Process(&process), &options)
      .await?;
    Ok(self.store.get_process(&process.id).await?)
  }

  /// Insert or replace an entity and run the after-save hooks. Returns
  /// whether the entity was new.
  pub async fn save_entity(&self, entity: &Entity, options: SaveOptions) -> Result<bool, EngineError> {
    let is_new = self.store.save_entity(entity).await?;
    tracing::debug!(
      entity_type = %entity.entity_type,
      entity_id = %entity.id,
      is_new,
      "entity_saved"
    );

    self
      .hooks
      .run_after_save(self, &Record::Entity { entity, is_new }, &options)
      .await?;
    Ok(is_new)
  }

  /// Remove a process: soft delete, interrupt it unless it had ended, then
  /// run the after-remove hooks. Returns false when it was already gone.
  ///
  /// A worker currently advancing the process finishes its node in flight
  /// and stops before the next one.
  #[instrument(skip(self, options))]
  pub async fn remove_process(&self, process_id: &str, options: SaveOptions) -> Result<bool, EngineError> {
    let Some(mut process) = self.store.find_process(process_id).await? else {
      return Ok(false);
    };
    if !self.store.mark_process_deleted(process_id).await? {
      return Ok(false);
    }

    process.deleted = true;
    if process.status != ProcessStatus::Ended {
      process.status = ProcessStatus::Interrupted;
      self.store.update_process(&process).await?;
    }

    tracing::info!(process_id, status = ?process.status, "process_removed");
    self.notifier.notify(ProcessEvent::ProcessRemoved {
      process_id: process_id.to_string(),
    });

    self
      .hooks
      .run_after_remove(self, &Record::Process(&process), &options)
      .await?;
    Ok(true)
  }

  /// Make sure `process_id` gets advanced: inline when
  /// `process_immediately` is set, otherwise by scheduling a job.
  pub async fn continue_process(&self, process_id: &str) -> Result<(), EngineError> {
    if self.settings.process_immediately {
      let root_id = self.scheduler.root_of(process_id).await?;
      self.advancer.advance_all_pending(Some(&root_id)).await?;
    } else {
      self.scheduler.schedule_for_process(process_id, Utc::now()).await?;
    }
    Ok(())
  }

  /// Run one claimed job.
  #[instrument(skip(self, job), fields(job_id = %job.id, kind = ?job.kind))]
  pub async fn run_job(&self, job: &Job) -> Result<(), EngineError> {
    match job.kind {
      JobKind::GlobalSweep => {
        self.advancer.advance_all_pending(None).await?;
      }
      JobKind::ProcessContinuation => {
        let process_id = job
          .target_id
          .as_deref()
          .ok_or_else(|| EngineError::InvalidJob {
            job_id: job.id.clone(),
            message: "continuation without a target process".to_string(),
          })?;
        self.advancer.advance_all_pending(Some(process_id)).await?;
      }
      JobKind::Dispatch => {
        self.scheduler.dispatch(Utc::now()).await?;
      }
    }
    Ok(())
  }

  /// A process, removed or not, with its flow nodes in sequence order.
  pub async fn process_snapshot(&self, process_id: &str) -> Result<(Process, Vec<FlowNode>), EngineError> {
    let process = self
      .store
      .get_process(process_id)
      .await
      .map_err(|e| EngineError::from_process_lookup(process_id, e))?;
    let nodes = self.store.list_flow_nodes(process_id).await?;
    Ok((process, nodes))
  }
}
