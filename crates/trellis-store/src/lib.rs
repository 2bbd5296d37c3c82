//! Trellis Store
//!
//! This crate provides the storage traits and implementations for process
//! instances, their flow nodes, the business entities processes operate on,
//! and the continuation job queue. Data is persisted to SQLite, or kept in
//! memory for tests and embedding.
//!
//! The [`Store`] trait defines operations for:
//! - Creating, updating and soft-removing processes
//! - The lock primitives the engine's lock manager is built on
//! - Creating, updating and bulk-transitioning flow nodes
//! - Reading and writing entities keyed by type and id
//!
//! The [`JobQueue`] trait defines the typed, time-stamped job interface the
//! scheduler enqueues continuations into.

mod memory;
mod queue;
mod sqlite;
mod types;

pub use memory::{MemoryJobQueue, MemoryStore};
pub use queue::{Job, JobKind, JobQueue, JobStatus};
pub use sqlite::SqliteStore;
pub use types::{
  Entity, EntityRef, FlowNode, FlowNodeStatus, Process, ProcessStatus, now_millis,
};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A flow node status change that would move backwards or leave a
  /// terminal status.
  #[error("flow node '{flow_node_id}' cannot move from {from:?} to {to:?}")]
  InvalidTransition {
    flow_node_id: String,
    from: FlowNodeStatus,
    to: FlowNodeStatus,
  },
}

/// Storage trait for processes, flow nodes and entities.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new process.
  async fn create_process(&self, process: &Process) -> Result<(), Error>;

  /// Get a process by ID, including removed ones.
  async fn get_process(&self, process_id: &str) -> Result<Process, Error>;

  /// Get a live (not removed) process by ID.
  async fn find_process(&self, process_id: &str) -> Result<Option<Process>, Error>;

  /// Persist status, target and variables. Lock fields are left untouched.
  async fn update_process(&self, process: &Process) -> Result<(), Error>;

  /// Soft-remove a process. Returns false when it was already removed.
  async fn mark_process_deleted(&self, process_id: &str) -> Result<bool, Error>;

  /// Live processes whose `parent_process_id` is the given process.
  async fn list_child_processes(&self, parent_process_id: &str) -> Result<Vec<Process>, Error>;

  /// Live, started processes that own at least one actionable flow node.
  ///
  /// With a scope, only the scope process and its descendants are listed.
  /// Ordered by creation.
  async fn list_pending_processes(&self, scope: Option<&str>) -> Result<Vec<Process>, Error>;

  /// Unlocked live root processes whose tree has actionable flow nodes.
  async fn list_pending_roots(&self) -> Result<Vec<Process>, Error>;

  /// Atomically take the lock of a live process.
  ///
  /// Returns `None` when another worker holds it. The heartbeat becomes
  /// `max(previous + 1, now_ms)`.
  async fn try_lock_process(&self, process_id: &str, now_ms: i64)
  -> Result<Option<Process>, Error>;

  /// Clear the lock and re-stamp the heartbeat, unconditionally.
  async fn unlock_process(&self, process_id: &str, now_ms: i64) -> Result<(), Error>;

  /// Release locks whose heartbeat is older than `older_than_ms`.
  async fn release_stale_locks(&self, older_than_ms: i64, now_ms: i64)
  -> Result<Vec<String>, Error>;

  /// Create a new flow node. A missing or removed process is `NotFound`.
  async fn create_flow_node(&self, node: &FlowNode) -> Result<(), Error>;

  /// Get a flow node by ID.
  async fn get_flow_node(&self, flow_node_id: &str) -> Result<FlowNode, Error>;

  /// Persist status, deferral, target, data and error of a flow node.
  ///
  /// Only an open (pending or standby) stored node is written. A node that
  /// was processed, failed or rejected in the meantime is
  /// `InvalidTransition`.
  async fn update_flow_node(&self, node: &FlowNode) -> Result<(), Error>;

  /// Flow nodes of a process in sequence order.
  async fn list_flow_nodes(&self, process_id: &str) -> Result<Vec<FlowNode>, Error>;

  /// Move every non-terminal flow node of a process to rejected.
  async fn reject_open_flow_nodes(&self, process_id: &str) -> Result<Vec<String>, Error>;

  /// Clear `is_deferred` on up to `limit` open flow nodes waiting on the
  /// given target. Returns the ids of the cleared nodes.
  async fn clear_deferred(
    &self,
    target_type: &str,
    target_id: &str,
    limit: u32,
  ) -> Result<Vec<String>, Error>;

  /// Insert or replace an entity. Returns true when it did not exist before.
  async fn save_entity(&self, entity: &Entity) -> Result<bool, Error>;

  /// Get an entity by type and ID.
  async fn get_entity(&self, entity_type: &str, id: &str) -> Result<Entity, Error>;

  /// Get an entity by type and ID, if present.
  async fn find_entity(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, Error>;

  /// List entities of a type.
  async fn list_entities(&self, entity_type: &str) -> Result<Vec<Entity>, Error>;
}
