//! Worker loop.
//!
//! A [`Worker`] drives the job queue: every tick it schedules a dispatch,
//! then claims and runs due jobs until none are left. Several workers may
//! share one store; the per-process lock keeps them apart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trellis_config::SchedulingMode;
use trellis_store::Job;

use crate::engine::ProcessEngine;
use crate::error::EngineError;

/// Jobs run by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
  pub completed: usize,
  pub failed: usize,
}

/// Claims and runs continuation jobs.
///
/// # Usage
///
/// ```ignore
/// let worker = Worker::new(engine.clone());
///
/// let cancel = CancellationToken::new();
/// worker.start(cancel).await?;
/// ```
pub struct Worker {
  engine: Arc<ProcessEngine>,
  interval: Duration,
  max_concurrent_jobs: usize,
}

impl Worker {
  /// A worker using the engine's interval and concurrency settings.
  pub fn new(engine: Arc<ProcessEngine>) -> Self {
    let settings = engine.settings();
    let interval = Duration::from_millis(settings.sweep_interval_ms);
    let max_concurrent_jobs = settings.max_concurrent_jobs.max(1);
    Self {
      engine,
      interval,
      max_concurrent_jobs,
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// One round: schedule a dispatch, then run due jobs until the queue has
  /// nothing due. Jobs run one at a time in sequential mode and up to
  /// `max_concurrent_jobs` at once in parallel mode.
  pub async fn tick(&self) -> Result<TickReport, EngineError> {
    self.engine.scheduler().schedule_dispatch(Utc::now()).await?;

    let limit = match self.engine.scheduler().mode() {
      SchedulingMode::Sequential => 1,
      SchedulingMode::Parallel => u32::try_from(self.max_concurrent_jobs).unwrap_or(u32::MAX),
    };

    let mut report = TickReport::default();
    loop {
      let jobs = self.engine.queue().claim_due(Utc::now(), limit).await?;
      if jobs.is_empty() {
        break;
      }

      for succeeded in join_all(jobs.iter().map(|job| self.run(job))).await {
        if succeeded? {
          report.completed += 1;
        } else {
          report.failed += 1;
        }
      }
    }
    Ok(report)
  }

  /// Run the tick loop until cancelled.
  pub async fn start(self, cancel: CancellationToken) -> Result<(), EngineError> {
    info!(
      mode = ?self.engine.scheduler().mode(),
      interval_ms = self.interval.as_millis() as u64,
      "worker_started"
    );

    loop {
      match self.tick().await {
        Ok(report) if report.completed + report.failed > 0 => {
          info!(completed = report.completed, failed = report.failed, "worker_tick");
        }
        Ok(_) => {}
        // Store trouble is transient from the worker's point of view.
        Err(e) => error!(error = %e, "worker_tick_failed"),
      }

      tokio::select! {
        _ = cancel.cancelled() => {
          info!("worker_cancelled");
          break;
        }
        _ = tokio::time::sleep(self.interval) => {}
      }
    }

    Ok(())
  }

  /// Run one job and record the outcome. Returns whether it succeeded;
  /// only queue errors are propagated.
  async fn run(&self, job: &Job) -> Result<bool, EngineError> {
    match self.engine.run_job(job).await {
      Ok(()) => {
        self.engine.queue().complete(&job.id).await?;
        Ok(true)
      }
      Err(e) => {
        error!(
          job_id = %job.id,
          kind = ?job.kind,
          configuration = e.is_configuration(),
          error = %e,
          "job_failed"
        );
        self.engine.queue().fail(&job.id, &e.to_string()).await?;
        Ok(false)
      }
    }
  }
}
