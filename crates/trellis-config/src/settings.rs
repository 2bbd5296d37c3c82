//! Engine settings.
//!
//! Every field has a default, so an empty JSON object is a valid settings
//! file:
//!
//! ```json
//! { "schedulingMode": "parallel", "deferredBatchSize": 20, "lockStaleAfterSecs": 600 }
//! ```

use serde::{Deserialize, Serialize};

/// How continuation work is fanned out to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
  /// One recurring sweep job walks every process with pending work.
  #[default]
  Sequential,
  /// A dispatch pass enqueues one continuation job per eligible root process.
  Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
  pub scheduling_mode: SchedulingMode,
  /// Interval between worker ticks.
  pub sweep_interval_ms: u64,
  /// Maximum flow nodes reactivated by a single entity save.
  pub deferred_batch_size: usize,
  /// Locks whose heartbeat is older than this are released by the sweep.
  /// `None` disables stale-lock recovery.
  pub lock_stale_after_secs: Option<u64>,
  /// Upper bound on advancement passes over one process per invocation.
  pub max_passes_per_advance: usize,
  /// UTC offset used for `today` and date shifting, e.g. `+02:00` or `UTC`.
  pub time_zone: String,
  /// Advance a newly started process inline instead of scheduling a job.
  pub process_immediately: bool,
  /// Continuation jobs run concurrently per worker tick in parallel mode.
  pub max_concurrent_jobs: usize,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      scheduling_mode: SchedulingMode::Sequential,
      sweep_interval_ms: 5_000,
      deferred_batch_size: 50,
      lock_stale_after_secs: None,
      max_passes_per_advance: 100,
      time_zone: "UTC".to_string(),
      process_immediately: false,
      max_concurrent_jobs: 8,
    }
  }
}

impl EngineSettings {
  /// Parse settings from a JSON document.
  pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(content)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_object_yields_defaults() {
    let settings = EngineSettings::from_json("{}").unwrap();
    assert_eq!(settings, EngineSettings::default());
  }

  #[test]
  fn test_partial_override() {
    let settings = EngineSettings::from_json(
      r#"{ "schedulingMode": "parallel", "lockStaleAfterSecs": 600, "timeZone": "+02:00" }"#,
    )
    .unwrap();

    assert_eq!(settings.scheduling_mode, SchedulingMode::Parallel);
    assert_eq!(settings.lock_stale_after_secs, Some(600));
    assert_eq!(settings.time_zone, "+02:00");
    assert_eq!(settings.deferred_batch_size, 50);
  }
}
