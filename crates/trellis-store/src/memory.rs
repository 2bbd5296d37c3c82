use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::queue::truncate_millis;
use crate::{
  Entity, Error, FlowNode, FlowNodeStatus, Job, JobKind, JobQueue, JobStatus, Process,
  ProcessStatus, Store,
};

#[derive(Default)]
struct State {
  processes: HashMap<String, Process>,
  flow_nodes: HashMap<String, FlowNode>,
  entities: BTreeMap<(String, String), Entity>,
}

impl State {
  fn live(&self, process_id: &str) -> Option<&Process> {
    self.processes.get(process_id).filter(|p| !p.deleted)
  }

  fn has_actionable(&self, process_id: &str) -> bool {
    self
      .flow_nodes
      .values()
      .any(|n| n.process_id == process_id && n.is_actionable())
  }

  fn is_pending(&self, process: &Process) -> bool {
    !process.deleted && process.status == ProcessStatus::Started && self.has_actionable(&process.id)
  }

  /// The process and all its live descendants.
  fn tree(&self, root_id: &str) -> HashSet<String> {
    let mut tree = HashSet::new();
    let mut frontier = vec![root_id.to_string()];
    while let Some(id) = frontier.pop() {
      if !tree.insert(id.clone()) {
        continue;
      }
      frontier.extend(
        self
          .processes
          .values()
          .filter(|p| !p.deleted && p.parent_process_id.as_deref() == Some(id.as_str()))
          .map(|p| p.id.clone()),
      );
    }
    tree
  }

  fn sorted(mut processes: Vec<Process>) -> Vec<Process> {
    processes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    processes
  }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
  state: RwLock<State>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_process(&self, process: &Process) -> Result<(), Error> {
    self
      .state
      .write()
      .await
      .processes
      .insert(process.id.clone(), process.clone());
    Ok(())
  }

  async fn get_process(&self, process_id: &str) -> Result<Process, Error> {
    self
      .state
      .read()
      .await
      .processes
      .get(process_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("process '{}'", process_id)))
  }

  async fn find_process(&self, process_id: &str) -> Result<Option<Process>, Error> {
    Ok(self.state.read().await.live(process_id).cloned())
  }

  async fn update_process(&self, process: &Process) -> Result<(), Error> {
    let mut state = self.state.write().await;
    let stored = state
      .processes
      .get_mut(&process.id)
      .ok_or_else(|| Error::NotFound(format!("process '{}'", process.id)))?;

    stored.status = process.status;
    stored.target_type = process.target_type.clone();
    stored.target_id = process.target_id.clone();
    stored.variables = process.variables.clone();
    Ok(())
  }

  async fn mark_process_deleted(&self, process_id: &str) -> Result<bool, Error> {
    let mut state = self.state.write().await;
    let stored = state
      .processes
      .get_mut(process_id)
      .ok_or_else(|| Error::NotFound(format!("process '{}'", process_id)))?;

    let was_live = !stored.deleted;
    stored.deleted = true;
    Ok(was_live)
  }

  async fn list_child_processes(&self, parent_process_id: &str) -> Result<Vec<Process>, Error> {
    let state = self.state.read().await;
    Ok(State::sorted(
      state
        .processes
        .values()
        .filter(|p| !p.deleted && p.parent_process_id.as_deref() == Some(parent_process_id))
        .cloned()
        .collect(),
    ))
  }

  async fn list_pending_processes(&self, scope: Option<&str>) -> Result<Vec<Process>, Error> {
    let state = self.state.read().await;
    let tree = scope.map(|root_id| state.tree(root_id));
    Ok(State::sorted(
      state
        .processes
        .values()
        .filter(|p| tree.as_ref().is_none_or(|t| t.contains(&p.id)))
        .filter(|p| state.is_pending(p))
        .cloned()
        .collect(),
    ))
  }

  async fn list_pending_roots(&self) -> Result<Vec<Process>, Error> {
    let state = self.state.read().await;
    Ok(State::sorted(
      state
        .processes
        .values()
        .filter(|p| p.is_root() && !p.deleted && !p.is_locked)
        .filter(|p| {
          state
            .tree(&p.id)
            .iter()
            .filter_map(|id| state.processes.get(id))
            .any(|member| state.is_pending(member))
        })
        .cloned()
        .collect(),
    ))
  }

  async fn try_lock_process(
    &self,
    process_id: &str,
    now_ms: i64,
  ) -> Result<Option<Process>, Error> {
    let mut state = self.state.write().await;
    let process = state
      .processes
      .get_mut(process_id)
      .filter(|p| !p.deleted)
      .ok_or_else(|| Error::NotFound(format!("process '{}'", process_id)))?;

    if process.is_locked {
      return Ok(None);
    }
    process.is_locked = true;
    process.visit_timestamp = (process.visit_timestamp + 1).max(now_ms);
    Ok(Some(process.clone()))
  }

  async fn unlock_process(&self, process_id: &str, now_ms: i64) -> Result<(), Error> {
    let mut state = self.state.write().await;
    if let Some(process) = state.processes.get_mut(process_id) {
      process.is_locked = false;
      process.visit_timestamp = (process.visit_timestamp + 1).max(now_ms);
    }
    Ok(())
  }

  async fn release_stale_locks(
    &self,
    older_than_ms: i64,
    now_ms: i64,
  ) -> Result<Vec<String>, Error> {
    let mut state = self.state.write().await;
    let mut released = Vec::new();
    for process in state.processes.values_mut() {
      if process.is_locked && process.visit_timestamp < older_than_ms {
        process.is_locked = false;
        process.visit_timestamp = (process.visit_timestamp + 1).max(now_ms);
        released.push(process.id.clone());
      }
    }
    Ok(released)
  }

  async fn create_flow_node(&self, node: &FlowNode) -> Result<(), Error> {
    let mut state = self.state.write().await;
    if state.live(&node.process_id).is_none() {
      return Err(Error::NotFound(format!("process '{}'", node.process_id)));
    }
    state.flow_nodes.insert(node.id.clone(), node.clone());
    Ok(())
  }

  async fn get_flow_node(&self, flow_node_id: &str) -> Result<FlowNode, Error> {
    self
      .state
      .read()
      .await
      .flow_nodes
      .get(flow_node_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("flow node '{}'", flow_node_id)))
  }

  async fn update_flow_node(&self, node: &FlowNode) -> Result<(), Error> {
    let mut state = self.state.write().await;
    let stored = state
      .flow_nodes
      .get_mut(&node.id)
      .ok_or_else(|| Error::NotFound(format!("flow node '{}'", node.id)))?;
    if stored.status.is_terminal() {
      return Err(Error::InvalidTransition {
        flow_node_id: node.id.clone(),
        from: stored.status,
        to: node.status,
      });
    }

    stored.status = node.status;
    stored.is_deferred = node.is_deferred;
    stored.target_type = node.target_type.clone();
    stored.target_id = node.target_id.clone();
    stored.data = node.data.clone();
    stored.error = node.error.clone();
    stored.processed_at = node.processed_at;
    Ok(())
  }

  async fn list_flow_nodes(&self, process_id: &str) -> Result<Vec<FlowNode>, Error> {
    let state = self.state.read().await;
    let mut nodes: Vec<FlowNode> = state
      .flow_nodes
      .values()
      .filter(|n| n.process_id == process_id)
      .cloned()
      .collect();
    nodes.sort_by_key(|n| n.sequence);
    Ok(nodes)
  }

  async fn reject_open_flow_nodes(&self, process_id: &str) -> Result<Vec<String>, Error> {
    let mut state = self.state.write().await;
    let mut rejected = Vec::new();
    for node in state.flow_nodes.values_mut() {
      if node.process_id == process_id && !node.status.is_terminal() {
        node.mark_rejected()?;
        rejected.push(node.id.clone());
      }
    }
    Ok(rejected)
  }

  async fn clear_deferred(
    &self,
    target_type: &str,
    target_id: &str,
    limit: u32,
  ) -> Result<Vec<String>, Error> {
    let mut state = self.state.write().await;
    let mut waiting: Vec<&mut FlowNode> = state
      .flow_nodes
      .values_mut()
      .filter(|n| {
        n.is_deferred
          && matches!(n.status, FlowNodeStatus::Pending | FlowNodeStatus::Standby)
          && n.target_type.as_deref() == Some(target_type)
          && n.target_id.as_deref() == Some(target_id)
      })
      .collect();
    waiting.sort_by_key(|n| (n.created_at, n.sequence));

    Ok(
      waiting
        .into_iter()
        .take(limit as usize)
        .map(|node| {
          node.is_deferred = false;
          node.id.clone()
        })
        .collect(),
    )
  }

  async fn save_entity(&self, entity: &Entity) -> Result<bool, Error> {
    let key = (entity.entity_type.clone(), entity.id.clone());
    Ok(
      self
        .state
        .write()
        .await
        .entities
        .insert(key, entity.clone())
        .is_none(),
    )
  }

  async fn get_entity(&self, entity_type: &str, id: &str) -> Result<Entity, Error> {
    self
      .find_entity(entity_type, id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("{} '{}'", entity_type, id)))
  }

  async fn find_entity(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, Error> {
    let key = (entity_type.to_string(), id.to_string());
    Ok(self.state.read().await.entities.get(&key).cloned())
  }

  async fn list_entities(&self, entity_type: &str) -> Result<Vec<Entity>, Error> {
    Ok(
      self
        .state
        .read()
        .await
        .entities
        .values()
        .filter(|e| e.entity_type == entity_type)
        .cloned()
        .collect(),
    )
  }
}

/// In-memory job queue.
#[derive(Default)]
pub struct MemoryJobQueue {
  jobs: RwLock<Vec<Job>>,
}

impl MemoryJobQueue {
  pub fn new() -> Self {
    Self::default()
  }

  async fn finish(&self, job_id: &str, status: JobStatus, error: Option<&str>) -> Result<(), Error> {
    let mut jobs = self.jobs.write().await;
    let job = jobs
      .iter_mut()
      .find(|j| j.id == job_id)
      .ok_or_else(|| Error::NotFound(format!("job '{}'", job_id)))?;
    job.status = status;
    job.error = error.map(str::to_string);
    Ok(())
  }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
  async fn enqueue(&self, job: &Job) -> Result<(), Error> {
    self.jobs.write().await.push(job.clone());
    Ok(())
  }

  async fn enqueue_if_absent(&self, job: &Job) -> Result<bool, Error> {
    let mut jobs = self.jobs.write().await;
    if jobs.iter().any(|j| {
      j.status == JobStatus::Pending && j.kind == job.kind && j.target_id == job.target_id
    }) {
      return Ok(false);
    }
    jobs.push(job.clone());
    Ok(true)
  }

  async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, Error> {
    let now = truncate_millis(now);
    let mut jobs = self.jobs.write().await;
    let mut due: Vec<&mut Job> = jobs
      .iter_mut()
      .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
      .collect();
    due.sort_by_key(|j| (j.run_at, j.created_at));

    Ok(
      due
        .into_iter()
        .take(limit as usize)
        .map(|job| {
          job.status = JobStatus::Running;
          job.attempts += 1;
          job.clone()
        })
        .collect(),
    )
  }

  async fn complete(&self, job_id: &str) -> Result<(), Error> {
    self.finish(job_id, JobStatus::Completed, None).await
  }

  async fn fail(&self, job_id: &str, error: &str) -> Result<(), Error> {
    self.finish(job_id, JobStatus::Failed, Some(error)).await
  }

  async fn has_pending(&self, kind: JobKind, target_id: Option<&str>) -> Result<bool, Error> {
    Ok(self.jobs.read().await.iter().any(|j| {
      j.status == JobStatus::Pending && j.kind == kind && j.target_id.as_deref() == target_id
    }))
  }

  async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, Error> {
    let mut jobs: Vec<Job> = self
      .jobs
      .read()
      .await
      .iter()
      .filter(|j| status.is_none_or(|s| j.status == s))
      .cloned()
      .collect();
    jobs.sort_by_key(|j| (j.run_at, j.created_at));
    Ok(jobs)
  }
}
