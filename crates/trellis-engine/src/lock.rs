//! Per-process mutual exclusion.
//!
//! The lock is the `is_locked` flag on the process row plus its
//! `visit_timestamp` heartbeat. Acquisition is atomic in the store; release
//! is a plain write. Contention is not an error: a busy process is skipped
//! and picked up by a later sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use trellis_store::{Process, Store, now_millis};

use crate::error::EngineError;

/// Result of a lock attempt.
#[derive(Debug)]
pub enum LockOutcome {
  /// The caller now holds the lock; the process as locked.
  Acquired(Process),
  /// Another worker holds the lock.
  Busy,
}

#[derive(Clone)]
pub struct LockManager {
  store: Arc<dyn Store>,
  stale_after: Option<Duration>,
}

impl LockManager {
  /// `stale_after` of `None` disables stale-lock recovery.
  pub fn new(store: Arc<dyn Store>, stale_after: Option<Duration>) -> Self {
    Self { store, stale_after }
  }

  /// Try to take the lock of a live process.
  pub async fn acquire(&self, process_id: &str) -> Result<LockOutcome, EngineError> {
    let locked = self
      .store
      .try_lock_process(process_id, now_millis())
      .await
      .map_err(|e| EngineError::from_process_lookup(process_id, e))?;

    match locked {
      Some(process) => {
        tracing::trace!(process_id, visit_timestamp = process.visit_timestamp, "lock_acquired");
        Ok(LockOutcome::Acquired(process))
      }
      None => {
        tracing::debug!(process_id, "lock_busy");
        Ok(LockOutcome::Busy)
      }
    }
  }

  /// Clear the lock and re-stamp the heartbeat.
  pub async fn release(&self, process_id: &str) -> Result<(), EngineError> {
    self.store.unlock_process(process_id, now_millis()).await?;
    tracing::trace!(process_id, "lock_released");
    Ok(())
  }

  /// Release locks whose heartbeat is older than the staleness threshold.
  ///
  /// A holder that crashed mid-advancement leaves its process locked;
  /// this returns it to the pool. Does nothing when recovery is disabled.
  pub async fn recover_stale(&self, now_ms: i64) -> Result<Vec<String>, EngineError> {
    let Some(stale_after) = self.stale_after else {
      return Ok(Vec::new());
    };

    let threshold = now_ms.saturating_sub(i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX));
    let released = self.store.release_stale_locks(threshold, now_ms).await?;
    for process_id in &released {
      tracing::warn!(process_id = %process_id, stale_after_secs = stale_after.as_secs(), "stale_lock_released");
    }
    Ok(released)
  }

  /// Run `f` while holding the lock of `process_id`.
  ///
  /// Returns `Ok(None)` when the process is busy. The lock is released
  /// whether `f` succeeds or fails; an error from `f` takes precedence over
  /// an error from the release.
  pub async fn with_lock<F, Fut, T>(&self, process_id: &str, f: F) -> Result<Option<T>, EngineError>
  where
    F: FnOnce(Process) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
  {
    let process = match self.acquire(process_id).await? {
      LockOutcome::Acquired(process) => process,
      LockOutcome::Busy => return Ok(None),
    };

    let result = f(process).await;
    let released = self.release(process_id).await;

    match (result, released) {
      (Ok(value), Ok(())) => Ok(Some(value)),
      (Ok(_), Err(e)) => Err(e),
      (Err(e), Ok(())) => Err(e),
      (Err(e), Err(release_error)) => {
        tracing::error!(process_id, error = %release_error, "lock_release_failed");
        Err(e)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use trellis_config::ProcessDef;
  use trellis_store::MemoryStore;

  async fn setup(stale_after: Option<Duration>) -> (Arc<MemoryStore>, LockManager, Process) {
    let store = Arc::new(MemoryStore::new());
    let def: ProcessDef = serde_json::from_value(serde_json::json!({
      "name": "Noop",
      "elements": [{ "elementId": "start", "type": "startEvent" }]
    }))
    .unwrap();
    let process = Process::new(def);
    store.create_process(&process).await.unwrap();
    let locks = LockManager::new(store.clone(), stale_after);
    (store, locks, process)
  }

  #[tokio::test]
  async fn test_second_acquire_is_busy() {
    let (store, locks, process) = setup(None).await;

    assert!(matches!(locks.acquire(&process.id).await.unwrap(), LockOutcome::Acquired(_)));
    assert!(matches!(locks.acquire(&process.id).await.unwrap(), LockOutcome::Busy));

    locks.release(&process.id).await.unwrap();
    assert!(!store.get_process(&process.id).await.unwrap().is_locked);
  }

  #[tokio::test]
  async fn test_missing_process() {
    let (_, locks, _) = setup(None).await;
    assert!(matches!(
      locks.acquire("nope").await,
      Err(EngineError::ProcessNotFound(id)) if id == "nope"
    ));
  }

  #[tokio::test]
  async fn test_with_lock_releases_on_error() {
    let (store, locks, process) = setup(None).await;

    let result: Result<Option<()>, _> = locks
      .with_lock(&process.id, |p| async move {
        assert!(p.is_locked);
        Err(EngineError::ProcessNotFound(p.id))
      })
      .await;

    assert!(result.is_err());
    assert!(!store.get_process(&process.id).await.unwrap().is_locked);
  }

  #[tokio::test]
  async fn test_with_lock_skips_busy() {
    let (_, locks, process) = setup(None).await;
    let LockOutcome::Acquired(_) = locks.acquire(&process.id).await.unwrap() else {
      panic!("expected lock");
    };

    let ran = locks.with_lock(&process.id, |_| async { Ok(()) }).await.unwrap();
    assert!(ran.is_none());
  }

  #[tokio::test]
  async fn test_recover_stale() {
    let (store, locks, process) = setup(Some(Duration::from_secs(60))).await;
    let LockOutcome::Acquired(locked) = locks.acquire(&process.id).await.unwrap() else {
      panic!("expected lock");
    };

    // Fresh heartbeat survives.
    assert!(locks.recover_stale(now_millis()).await.unwrap().is_empty());

    let later = locked.visit_timestamp + 61_000;
    assert_eq!(locks.recover_stale(later).await.unwrap(), vec![process.id.clone()]);
    assert!(!store.get_process(&process.id).await.unwrap().is_locked);
  }

  #[tokio::test]
  async fn test_recovery_disabled() {
    let (_, locks, process) = setup(None).await;
    locks.acquire(&process.id).await.unwrap();
    assert!(locks.recover_stale(i64::MAX).await.unwrap().is_empty());
  }
}
