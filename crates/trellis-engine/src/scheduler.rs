//! Continuation scheduling.
//!
//! The scheduler decides what to enqueue and when. Running jobs, retries
//! and backoff belong to whoever drives the queue (see [`crate::Worker`]).
//!
//! ```text
//!   sequential:  dispatch ──► 1 × globalSweep ──► advance_all_pending(None)
//!   parallel:    dispatch ──► N × processContinuation(root) ──► advance_all_pending(Some(root))
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use trellis_config::SchedulingMode;
use trellis_store::{Job, JobKind, JobQueue, Store, now_millis};

use crate::error::EngineError;
use crate::lock::LockManager;

#[derive(Clone)]
pub struct JobScheduler {
  queue: Arc<dyn JobQueue>,
  store: Arc<dyn Store>,
  locks: LockManager,
  mode: SchedulingMode,
}

impl JobScheduler {
  pub fn new(
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn Store>,
    locks: LockManager,
    mode: SchedulingMode,
  ) -> Self {
    Self {
      queue,
      store,
      locks,
      mode,
    }
  }

  pub fn mode(&self) -> SchedulingMode {
    self.mode
  }

  /// Enqueue a sweep over every process, unless one is already pending.
  pub async fn schedule_global_sweep(&self, at: DateTime<Utc>) -> Result<Option<Job>, EngineError> {
    self.enqueue_once(Job::new(JobKind::GlobalSweep, at)).await
  }

  /// Enqueue a continuation for one root process, unless one is already
  /// pending for it.
  pub async fn schedule_process_continuation(
    &self,
    process_id: &str,
    at: DateTime<Utc>,
  ) -> Result<Option<Job>, EngineError> {
    self.enqueue_once(Job::continuation(process_id, at)).await
  }

  /// Enqueue a dispatch pass, unless one is already pending.
  pub async fn schedule_dispatch(&self, at: DateTime<Utc>) -> Result<Option<Job>, EngineError> {
    self.enqueue_once(Job::new(JobKind::Dispatch, at)).await
  }

  /// Schedule whatever advances `process_id` in the current mode: the
  /// global sweep, or a continuation for the root of its tree.
  pub async fn schedule_for_process(
    &self,
    process_id: &str,
    at: DateTime<Utc>,
  ) -> Result<Option<Job>, EngineError> {
    match self.mode {
      SchedulingMode::Sequential => self.schedule_global_sweep(at).await,
      SchedulingMode::Parallel => {
        let root_id = self.root_of(process_id).await?;
        self.schedule_process_continuation(&root_id, at).await
      }
    }
  }

  /// Enumerate eligible work and enqueue it: one sweep in sequential mode,
  /// one continuation per unlocked root with pending work in parallel mode.
  pub async fn dispatch(&self, now: DateTime<Utc>) -> Result<Vec<Job>, EngineError> {
    self.locks.recover_stale(now_millis()).await?;

    let jobs = match self.mode {
      SchedulingMode::Sequential => self.schedule_global_sweep(now).await?.into_iter().collect(),
      SchedulingMode::Parallel => {
        let mut jobs = Vec::new();
        for root in self.store.list_pending_roots().await? {
          if let Some(job) = self.schedule_process_continuation(&root.id, now).await? {
            jobs.push(job);
          }
        }
        jobs
      }
    };

    tracing::debug!(mode = ?self.mode, enqueued = jobs.len(), "dispatch_completed");
    Ok(jobs)
  }

  async fn enqueue_once(&self, job: Job) -> Result<Option<Job>, EngineError> {
    if !self.queue.enqueue_if_absent(&job).await? {
      tracing::trace!(kind = ?job.kind, target_id = ?job.target_id, "job_already_pending");
      return Ok(None);
    }

    tracing::debug!(
      job_id = %job.id,
      kind = ?job.kind,
      target_id = ?job.target_id,
      run_at = %job.run_at,
      "job_enqueued"
    );
    Ok(Some(job))
  }

  /// Walk `parent_process_id` back-references to the root.
  pub async fn root_of(&self, process_id: &str) -> Result<String, EngineError> {
    let mut current = self
      .store
      .get_process(process_id)
      .await
      .map_err(|e| EngineError::from_process_lookup(process_id, e))?;
    while let Some(parent_id) = current.parent_process_id.clone() {
      current = self
        .store
        .get_process(&parent_id)
        .await
        .map_err(|e| EngineError::from_process_lookup(&parent_id, e))?;
    }
    Ok(current.id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use trellis_config::ProcessDef;
  use trellis_store::{JobStatus, MemoryJobQueue, MemoryStore, Process};

  fn scheduler(mode: SchedulingMode) -> (Arc<MemoryStore>, Arc<MemoryJobQueue>, JobScheduler) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let locks = LockManager::new(store.clone(), None);
    let scheduler = JobScheduler::new(queue.clone(), store.clone(), locks, mode);
    (store, queue, scheduler)
  }

  fn def() -> ProcessDef {
    serde_json::from_value(serde_json::json!({
      "name": "Noop",
      "elements": [{ "elementId": "start", "type": "startEvent" }]
    }))
    .unwrap()
  }

  #[tokio::test]
  async fn test_sweep_is_deduplicated() {
    let (_, queue, scheduler) = scheduler(SchedulingMode::Sequential);
    let now = Utc::now();

    assert!(scheduler.schedule_global_sweep(now).await.unwrap().is_some());
    assert!(scheduler.schedule_global_sweep(now).await.unwrap().is_none());
    assert!(scheduler.dispatch(now).await.unwrap().is_empty());
    assert_eq!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_continuations_are_per_root() {
    let (store, _, scheduler) = scheduler(SchedulingMode::Parallel);
    let root = Process::new(def());
    let child = Process::new(def()).with_parent(&root.id, "fn-1");
    let grandchild = Process::new(def()).with_parent(&child.id, "fn-2");
    for p in [&root, &child, &grandchild] {
      store.create_process(p).await.unwrap();
    }

    let job = scheduler
      .schedule_for_process(&grandchild.id, Utc::now())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(job.target_id.as_deref(), Some(root.id.as_str()));

    let again = scheduler
      .schedule_for_process(&child.id, Utc::now())
      .await
      .unwrap();
    assert!(again.is_none());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_racing_dispatchers_enqueue_one_continuation() {
    let (_, queue, scheduler) = scheduler(SchedulingMode::Parallel);
    let scheduler = Arc::new(scheduler);

    let attempts: Vec<_> = (0..8)
      .map(|_| {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
          scheduler
            .schedule_process_continuation("p-1", Utc::now())
            .await
            .unwrap()
        })
      })
      .collect();

    let mut enqueued = 0;
    for attempt in attempts {
      if attempt.await.unwrap().is_some() {
        enqueued += 1;
      }
    }
    assert_eq!(enqueued, 1);
    assert_eq!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_unknown_process() {
    let (_, _, scheduler) = scheduler(SchedulingMode::Parallel);
    assert!(matches!(
      scheduler.schedule_for_process("nope", Utc::now()).await,
      Err(EngineError::ProcessNotFound(_))
    ));
  }
}
