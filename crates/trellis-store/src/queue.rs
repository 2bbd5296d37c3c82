use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Error;

/// What a job does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "snake_case")]
pub enum JobKind {
  /// Advance every process with pending work.
  GlobalSweep,
  /// Advance one root process and its sub-processes.
  ProcessContinuation,
  /// Enumerate eligible work and enqueue sweeps or continuations.
  Dispatch,
}

/// Status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Running,
  Completed,
  Failed,
}

/// A typed, time-stamped unit of continuation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
  pub id: String,
  pub kind: JobKind,
  pub target_type: Option<String>,
  pub target_id: Option<String>,
  pub run_at: DateTime<Utc>,
  pub status: JobStatus,
  pub attempts: i64,
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
}

impl Job {
  /// A pending job of `kind` due at `run_at`.
  pub fn new(kind: JobKind, run_at: DateTime<Utc>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      kind,
      target_type: None,
      target_id: None,
      run_at: truncate_millis(run_at),
      status: JobStatus::Pending,
      attempts: 0,
      error: None,
      created_at: truncate_millis(Utc::now()),
    }
  }

  /// A continuation for one process.
  pub fn continuation(process_id: impl Into<String>, run_at: DateTime<Utc>) -> Self {
    let mut job = Self::new(JobKind::ProcessContinuation, run_at);
    job.target_type = Some("Process".to_string());
    job.target_id = Some(process_id.into());
    job
  }

  /// The `{targetType, targetId}` payload handed to job consumers.
  pub fn payload(&self) -> serde_json::Value {
    serde_json::json!({
      "targetType": self.target_type,
      "targetId": self.target_id,
    })
  }
}

/// Keeps text-encoded timestamps comparable in SQL.
pub(crate) fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Job queue the scheduler enqueues into and workers claim from.
///
/// Retry and backoff are owned by whoever drives the queue; a failed job is
/// recorded and left alone.
#[async_trait]
pub trait JobQueue: Send + Sync {
  /// Enqueue a job.
  async fn enqueue(&self, job: &Job) -> Result<(), Error>;

  /// Enqueue unless a pending job of the same kind and target exists.
  /// The check and the insert are one atomic step. Returns whether the job
  /// was enqueued.
  async fn enqueue_if_absent(&self, job: &Job) -> Result<bool, Error>;

  /// Atomically move up to `limit` due pending jobs to running, oldest
  /// first, and return them.
  async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, Error>;

  /// Mark a running job completed.
  async fn complete(&self, job_id: &str) -> Result<(), Error>;

  /// Mark a running job failed with an error message.
  async fn fail(&self, job_id: &str, error: &str) -> Result<(), Error>;

  /// Whether a pending job of `kind` exists for the target.
  async fn has_pending(&self, kind: JobKind, target_id: Option<&str>) -> Result<bool, Error>;

  /// List jobs, optionally filtered by status, oldest first.
  async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, Error>;
}
