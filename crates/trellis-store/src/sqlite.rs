use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::queue::truncate_millis;
use crate::{
  Entity, Error, FlowNode, Job, JobKind, JobQueue, JobStatus, Process, Store,
};

const PROCESS_COLUMNS: &str = "id, name, parent_process_id, parent_flow_node_id, status, \
  is_locked, visit_timestamp, target_type, target_id, definition, variables, deleted, created_at";

const FLOW_NODE_COLUMNS: &str = "id, process_id, element_id, element_type, status, is_deferred, \
  target_type, target_id, element_data, data, previous_flow_node_id, sequence, error, \
  created_at, processed_at";

const JOB_COLUMNS: &str =
  "id, kind, target_type, target_id, run_at, status, attempts, error, created_at";

/// Nodes that can be advanced right now.
const ACTIONABLE: &str = "n.status IN ('pending', 'standby') AND n.is_deferred = 0";

/// SQLite-based store implementation.
#[derive(Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// A private in-memory database. A single connection keeps every query on
  /// the same database.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_process(&self, process: &Process) -> Result<(), Error> {
    sqlx::query(&format!(
      "INSERT INTO processes ({PROCESS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&process.id)
    .bind(&process.name)
    .bind(&process.parent_process_id)
    .bind(&process.parent_flow_node_id)
    .bind(process.status)
    .bind(process.is_locked)
    .bind(process.visit_timestamp)
    .bind(&process.target_type)
    .bind(&process.target_id)
    .bind(&process.definition)
    .bind(&process.variables)
    .bind(process.deleted)
    .bind(process.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_process(&self, process_id: &str) -> Result<Process, Error> {
    sqlx::query_as(&format!(
      "SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ?"
    ))
    .bind(process_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("process '{}'", process_id)))
  }

  async fn find_process(&self, process_id: &str) -> Result<Option<Process>, Error> {
    Ok(
      sqlx::query_as(&format!(
        "SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ? AND deleted = 0"
      ))
      .bind(process_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn update_process(&self, process: &Process) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE processes
      SET status = ?, target_type = ?, target_id = ?, variables = ?
      WHERE id = ?
      "#,
    )
    .bind(process.status)
    .bind(&process.target_type)
    .bind(&process.target_id)
    .bind(&process.variables)
    .bind(&process.id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("process '{}'", process.id)));
    }
    Ok(())
  }

  async fn mark_process_deleted(&self, process_id: &str) -> Result<bool, Error> {
    let result = sqlx::query("UPDATE processes SET deleted = 1 WHERE id = ? AND deleted = 0")
      .bind(process_id)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 1 {
      return Ok(true);
    }
    // Distinguish "already removed" from "never existed".
    self.get_process(process_id).await?;
    Ok(false)
  }

  async fn list_child_processes(&self, parent_process_id: &str) -> Result<Vec<Process>, Error> {
    Ok(
      sqlx::query_as(&format!(
        "SELECT {PROCESS_COLUMNS} FROM processes \
         WHERE parent_process_id = ? AND deleted = 0 ORDER BY created_at, id"
      ))
      .bind(parent_process_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn list_pending_processes(&self, scope: Option<&str>) -> Result<Vec<Process>, Error> {
    let processes = match scope {
      None => {
        sqlx::query_as(&format!(
          "SELECT {PROCESS_COLUMNS} FROM processes p \
           WHERE p.deleted = 0 AND p.status = 'started' \
           AND EXISTS (SELECT 1 FROM flow_nodes n WHERE n.process_id = p.id AND {ACTIONABLE}) \
           ORDER BY p.created_at, p.id"
        ))
        .fetch_all(&self.pool)
        .await?
      }
      Some(root_id) => {
        sqlx::query_as(&format!(
          "WITH RECURSIVE tree(id) AS ( \
             SELECT id FROM processes WHERE id = ? \
             UNION ALL \
             SELECT c.id FROM processes c JOIN tree t ON c.parent_process_id = t.id \
           ) \
           SELECT {PROCESS_COLUMNS} FROM processes p \
           WHERE p.id IN (SELECT id FROM tree) AND p.deleted = 0 AND p.status = 'started' \
           AND EXISTS (SELECT 1 FROM flow_nodes n WHERE n.process_id = p.id AND {ACTIONABLE}) \
           ORDER BY p.created_at, p.id"
        ))
        .bind(root_id)
        .fetch_all(&self.pool)
        .await?
      }
    };
    Ok(processes)
  }

  async fn list_pending_roots(&self) -> Result<Vec<Process>, Error> {
    Ok(
      sqlx::query_as(&format!(
        "WITH RECURSIVE tree(root_id, id) AS ( \
           SELECT id, id FROM processes \
           WHERE parent_process_id IS NULL AND deleted = 0 AND is_locked = 0 \
           UNION ALL \
           SELECT t.root_id, c.id FROM processes c JOIN tree t ON c.parent_process_id = t.id \
           WHERE c.deleted = 0 \
         ) \
         SELECT {PROCESS_COLUMNS} FROM processes \
         WHERE id IN ( \
           SELECT t.root_id FROM tree t \
           JOIN processes p ON p.id = t.id AND p.status = 'started' \
           JOIN flow_nodes n ON n.process_id = t.id \
           WHERE {ACTIONABLE} \
         ) \
         ORDER BY created_at, id"
      ))
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn try_lock_process(
    &self,
    process_id: &str,
    now_ms: i64,
  ) -> Result<Option<Process>, Error> {
    let mut tx = self.pool.begin().await?;

    let acquired = sqlx::query(
      r#"
      UPDATE processes
      SET is_locked = 1, visit_timestamp = MAX(visit_timestamp + 1, ?)
      WHERE id = ? AND deleted = 0 AND is_locked = 0
      "#,
    )
    .bind(now_ms)
    .bind(process_id)
    .execute(&mut *tx)
    .await?
    .rows_affected()
      == 1;

    let process: Option<Process> = sqlx::query_as(&format!(
      "SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ? AND deleted = 0"
    ))
    .bind(process_id)
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;

    match process {
      None => Err(Error::NotFound(format!("process '{}'", process_id))),
      Some(process) if acquired => Ok(Some(process)),
      Some(_) => Ok(None),
    }
  }

  async fn unlock_process(&self, process_id: &str, now_ms: i64) -> Result<(), Error> {
    sqlx::query(
      r#"
      UPDATE processes
      SET is_locked = 0, visit_timestamp = MAX(visit_timestamp + 1, ?)
      WHERE id = ?
      "#,
    )
    .bind(now_ms)
    .bind(process_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn release_stale_locks(
    &self,
    older_than_ms: i64,
    now_ms: i64,
  ) -> Result<Vec<String>, Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
      r#"
      UPDATE processes
      SET is_locked = 0, visit_timestamp = MAX(visit_timestamp + 1, ?)
      WHERE is_locked = 1 AND visit_timestamp < ?
      RETURNING id
      "#,
    )
    .bind(now_ms)
    .bind(older_than_ms)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
  }

  async fn create_flow_node(&self, node: &FlowNode) -> Result<(), Error> {
    let result = sqlx::query(&format!(
      "INSERT INTO flow_nodes ({FLOW_NODE_COLUMNS}) \
       SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
       WHERE EXISTS (SELECT 1 FROM processes WHERE id = ? AND deleted = 0)"
    ))
    .bind(&node.id)
    .bind(&node.process_id)
    .bind(&node.element_id)
    .bind(&node.element_type)
    .bind(node.status)
    .bind(node.is_deferred)
    .bind(&node.target_type)
    .bind(&node.target_id)
    .bind(&node.element_data)
    .bind(&node.data)
    .bind(&node.previous_flow_node_id)
    .bind(node.sequence)
    .bind(&node.error)
    .bind(node.created_at)
    .bind(node.processed_at)
    .bind(&node.process_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("process '{}'", node.process_id)));
    }
    Ok(())
  }

  async fn get_flow_node(&self, flow_node_id: &str) -> Result<FlowNode, Error> {
    sqlx::query_as(&format!(
      "SELECT {FLOW_NODE_COLUMNS} FROM flow_nodes WHERE id = ?"
    ))
    .bind(flow_node_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("flow node '{}'", flow_node_id)))
  }

  async fn update_flow_node(&self, node: &FlowNode) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE flow_nodes
      SET status = ?, is_deferred = ?, target_type = ?, target_id = ?, data = ?,
          error = ?, processed_at = ?
      WHERE id = ? AND status IN ('pending', 'standby')
      "#,
    )
    .bind(node.status)
    .bind(node.is_deferred)
    .bind(&node.target_type)
    .bind(&node.target_id)
    .bind(&node.data)
    .bind(&node.error)
    .bind(node.processed_at)
    .bind(&node.id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      let stored = self.get_flow_node(&node.id).await?;
      return Err(Error::InvalidTransition {
        flow_node_id: node.id.clone(),
        from: stored.status,
        to: node.status,
      });
    }
    Ok(())
  }

  async fn list_flow_nodes(&self, process_id: &str) -> Result<Vec<FlowNode>, Error> {
    Ok(
      sqlx::query_as(&format!(
        "SELECT {FLOW_NODE_COLUMNS} FROM flow_nodes WHERE process_id = ? ORDER BY sequence"
      ))
      .bind(process_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn reject_open_flow_nodes(&self, process_id: &str) -> Result<Vec<String>, Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
      r#"
      UPDATE flow_nodes
      SET status = 'rejected', is_deferred = 0, processed_at = ?
      WHERE process_id = ? AND status IN ('pending', 'standby')
      RETURNING id
      "#,
    )
    .bind(Utc::now())
    .bind(process_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
  }

  async fn clear_deferred(
    &self,
    target_type: &str,
    target_id: &str,
    limit: u32,
  ) -> Result<Vec<String>, Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
      r#"
      UPDATE flow_nodes
      SET is_deferred = 0
      WHERE id IN (
        SELECT id FROM flow_nodes
        WHERE target_type = ? AND target_id = ? AND is_deferred = 1
          AND status IN ('pending', 'standby')
        ORDER BY created_at, sequence
        LIMIT ?
      )
      RETURNING id
      "#,
    )
    .bind(target_type)
    .bind(target_id)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
  }

  async fn save_entity(&self, entity: &Entity) -> Result<bool, Error> {
    let mut tx = self.pool.begin().await?;

    let existing: Option<(String,)> =
      sqlx::query_as("SELECT id FROM entities WHERE entity_type = ? AND id = ?")
        .bind(&entity.entity_type)
        .bind(&entity.id)
        .fetch_optional(&mut *tx)
        .await?;

    sqlx::query(
      r#"
      INSERT INTO entities (entity_type, id, attributes, links, modified_at)
      VALUES (?, ?, ?, ?, ?)
      ON CONFLICT (entity_type, id) DO UPDATE
      SET attributes = excluded.attributes, links = excluded.links,
          modified_at = excluded.modified_at
      "#,
    )
    .bind(&entity.entity_type)
    .bind(&entity.id)
    .bind(&entity.attributes)
    .bind(&entity.links)
    .bind(entity.modified_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(existing.is_none())
  }

  async fn get_entity(&self, entity_type: &str, id: &str) -> Result<Entity, Error> {
    self
      .find_entity(entity_type, id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("{} '{}'", entity_type, id)))
  }

  async fn find_entity(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, Error> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT entity_type, id, attributes, links, modified_at
        FROM entities
        WHERE entity_type = ? AND id = ?
        "#,
      )
      .bind(entity_type)
      .bind(id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn list_entities(&self, entity_type: &str) -> Result<Vec<Entity>, Error> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT entity_type, id, attributes, links, modified_at
        FROM entities
        WHERE entity_type = ?
        ORDER BY id
        "#,
      )
      .bind(entity_type)
      .fetch_all(&self.pool)
      .await?,
    )
  }
}

#[async_trait]
impl JobQueue for SqliteStore {
  async fn enqueue(&self, job: &Job) -> Result<(), Error> {
    sqlx::query(&format!(
      "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&job.id)
    .bind(job.kind)
    .bind(&job.target_type)
    .bind(&job.target_id)
    .bind(job.run_at)
    .bind(job.status)
    .bind(job.attempts)
    .bind(&job.error)
    .bind(job.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn enqueue_if_absent(&self, job: &Job) -> Result<bool, Error> {
    // One statement: SQLite holds the write lock across the check.
    let result = sqlx::query(&format!(
      "INSERT INTO jobs ({JOB_COLUMNS}) \
       SELECT ?, ?, ?, ?, ?, ?, ?, ?, ? \
       WHERE NOT EXISTS ( \
         SELECT 1 FROM jobs WHERE status = 'pending' AND kind = ? AND target_id IS ? \
       )"
    ))
    .bind(&job.id)
    .bind(job.kind)
    .bind(&job.target_type)
    .bind(&job.target_id)
    .bind(job.run_at)
    .bind(job.status)
    .bind(job.attempts)
    .bind(&job.error)
    .bind(job.created_at)
    .bind(job.kind)
    .bind(&job.target_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() > 0)
  }

  async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, Error> {
    let mut jobs: Vec<Job> = sqlx::query_as(&format!(
      "UPDATE jobs SET status = 'running', attempts = attempts + 1 \
       WHERE id IN ( \
         SELECT id FROM jobs WHERE status = 'pending' AND run_at <= ? \
         ORDER BY run_at, created_at LIMIT ? \
       ) \
       RETURNING {JOB_COLUMNS}"
    ))
    .bind(truncate_millis(now))
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    // RETURNING does not preserve the subquery order.
    jobs.sort_by(|a, b| (a.run_at, a.created_at).cmp(&(b.run_at, b.created_at)));
    Ok(jobs)
  }

  async fn complete(&self, job_id: &str) -> Result<(), Error> {
    self.finish_job(job_id, JobStatus::Completed, None).await
  }

  async fn fail(&self, job_id: &str, error: &str) -> Result<(), Error> {
    self.finish_job(job_id, JobStatus::Failed, Some(error)).await
  }

  async fn has_pending(&self, kind: JobKind, target_id: Option<&str>) -> Result<bool, Error> {
    let row: Option<(String,)> = sqlx::query_as(
      r#"
      SELECT id FROM jobs
      WHERE status = 'pending' AND kind = ? AND target_id IS ?
      LIMIT 1
      "#,
    )
    .bind(kind)
    .bind(target_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.is_some())
  }

  async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, Error> {
    let jobs = match status {
      Some(status) => {
        sqlx::query_as(&format!(
          "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY run_at, created_at"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?
      }
      None => {
        sqlx::query_as(&format!(
          "SELECT {JOB_COLUMNS} FROM jobs ORDER BY run_at, created_at"
        ))
        .fetch_all(&self.pool)
        .await?
      }
    };
    Ok(jobs)
  }
}

impl SqliteStore {
  async fn finish_job(
    &self,
    job_id: &str,
    status: JobStatus,
    error: Option<&str>,
  ) -> Result<(), Error> {
    let result = sqlx::query("UPDATE jobs SET status = ?, error = ? WHERE id = ?")
      .bind(status)
      .bind(error)
      .bind(job_id)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("job '{}'", job_id)));
    }
    Ok(())
  }
}
