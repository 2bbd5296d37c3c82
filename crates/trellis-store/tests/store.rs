use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use trellis_config::{ElementDef, ElementType, ProcessDef};
use trellis_store::{
  Entity, EntityRef, Error, FlowNode, FlowNodeStatus, Job, JobKind, JobQueue, JobStatus,
  MemoryJobQueue, MemoryStore, Process, ProcessStatus, SqliteStore, Store,
};

fn definition() -> ProcessDef {
  serde_json::from_value(json!({
    "name": "Follow up",
    "targetType": "Case",
    "elements": [
      { "elementId": "start", "type": "startEvent" },
      { "elementId": "end", "type": "endEvent" }
    ],
    "flows": [{ "from": "start", "to": "end" }]
  }))
  .unwrap()
}

fn started(target_id: &str) -> Process {
  let mut process = Process::new(definition()).with_target("Case", target_id);
  process.status = ProcessStatus::Started;
  process
}

fn pending_node(process: &Process, sequence: i64) -> FlowNode {
  FlowNode::new(
    &process.id,
    &ElementDef::new("start", ElementType::StartEvent),
    sequence,
  )
}

async fn sqlite() -> SqliteStore {
  let store = SqliteStore::in_memory().await.unwrap();
  store.migrate().await.unwrap();
  store
}

async fn process_round_trip(store: &dyn Store) {
  let process = started("c-1").with_variables(json!({ "attempt": 1 }));
  store.create_process(&process).await.unwrap();

  let loaded = store.get_process(&process.id).await.unwrap();
  assert_eq!(loaded.definition.0, definition());
  assert_eq!(loaded.variables.0, json!({ "attempt": 1 }));
  assert_eq!(loaded.target(), Some(EntityRef::new("Case", "c-1")));

  assert!(store.mark_process_deleted(&process.id).await.unwrap());
  assert!(!store.mark_process_deleted(&process.id).await.unwrap());
  assert!(store.find_process(&process.id).await.unwrap().is_none());
  assert!(store.get_process(&process.id).await.unwrap().deleted);

  assert!(matches!(
    store.mark_process_deleted("missing").await,
    Err(Error::NotFound(_))
  ));
}

async fn lock_protocol(store: &dyn Store) {
  let process = started("c-1");
  store.create_process(&process).await.unwrap();

  let locked = store.try_lock_process(&process.id, 1_000).await.unwrap().unwrap();
  assert!(locked.is_locked);
  assert_eq!(locked.visit_timestamp, 1_000);

  assert!(store.try_lock_process(&process.id, 1_001).await.unwrap().is_none());

  // The heartbeat never goes backwards, even with a skewed clock.
  store.unlock_process(&process.id, 500).await.unwrap();
  let released = store.get_process(&process.id).await.unwrap();
  assert!(!released.is_locked);
  assert_eq!(released.visit_timestamp, 1_001);

  assert!(matches!(
    store.try_lock_process("missing", 1_000).await,
    Err(Error::NotFound(_))
  ));
}

async fn stale_lock_release(store: &dyn Store) {
  let stale = started("c-1");
  let fresh = started("c-2");
  store.create_process(&stale).await.unwrap();
  store.create_process(&fresh).await.unwrap();
  store.try_lock_process(&stale.id, 1_000).await.unwrap().unwrap();
  store.try_lock_process(&fresh.id, 9_000).await.unwrap().unwrap();

  let released = store.release_stale_locks(5_000, 10_000).await.unwrap();
  assert_eq!(released, vec![stale.id.clone()]);
  assert!(!store.get_process(&stale.id).await.unwrap().is_locked);
  assert!(store.get_process(&fresh.id).await.unwrap().is_locked);
}

async fn flow_node_lifecycle(store: &dyn Store) {
  let process = started("c-1");
  store.create_process(&process).await.unwrap();

  let mut waiting = pending_node(&process, 1);
  waiting.defer_on(&EntityRef::new("Case", "c-1"));
  let mut done = pending_node(&process, 2);
  done.mark_processed().unwrap();
  let open = pending_node(&process, 3);
  for node in [&waiting, &done, &open] {
    store.create_flow_node(node).await.unwrap();
  }

  let ids: Vec<i64> = store
    .list_flow_nodes(&process.id)
    .await
    .unwrap()
    .iter()
    .map(|n| n.sequence)
    .collect();
  assert_eq!(ids, vec![1, 2, 3]);

  let rejected = store.reject_open_flow_nodes(&process.id).await.unwrap();
  assert_eq!(rejected.len(), 2);
  assert!(!rejected.contains(&done.id));

  let waiting = store.get_flow_node(&waiting.id).await.unwrap();
  assert_eq!(waiting.status, FlowNodeStatus::Rejected);
  assert!(!waiting.is_deferred);
  assert_eq!(
    store.get_flow_node(&done.id).await.unwrap().status,
    FlowNodeStatus::Processed
  );
}

async fn removed_process_is_sealed(store: &dyn Store) {
  let process = started("c-1");
  store.create_process(&process).await.unwrap();
  let mut running = pending_node(&process, 1);
  store.create_flow_node(&running).await.unwrap();

  store.mark_process_deleted(&process.id).await.unwrap();
  store.reject_open_flow_nodes(&process.id).await.unwrap();

  // A worker finishing the node afterwards cannot overwrite the rejection.
  running.mark_processed().unwrap();
  assert!(matches!(
    store.update_flow_node(&running).await,
    Err(Error::InvalidTransition {
      from: FlowNodeStatus::Rejected,
      to: FlowNodeStatus::Processed,
      ..
    })
  ));
  assert_eq!(
    store.get_flow_node(&running.id).await.unwrap().status,
    FlowNodeStatus::Rejected
  );

  assert!(matches!(
    store.create_flow_node(&pending_node(&process, 2)).await,
    Err(Error::NotFound(_))
  ));
  assert_eq!(store.list_flow_nodes(&process.id).await.unwrap().len(), 1);
}

async fn deferred_clearing_is_bounded(store: &dyn Store) {
  let process = started("c-1");
  store.create_process(&process).await.unwrap();

  for sequence in 1..=3 {
    let mut node = pending_node(&process, sequence);
    node.defer_on(&EntityRef::new("Case", "c-1"));
    store.create_flow_node(&node).await.unwrap();
  }
  let mut elsewhere = pending_node(&process, 4);
  elsewhere.defer_on(&EntityRef::new("Case", "c-2"));
  store.create_flow_node(&elsewhere).await.unwrap();

  assert_eq!(store.clear_deferred("Case", "c-1", 2).await.unwrap().len(), 2);
  assert_eq!(store.clear_deferred("Case", "c-1", 2).await.unwrap().len(), 1);
  assert!(store.clear_deferred("Case", "c-1", 2).await.unwrap().is_empty());
  assert!(store.get_flow_node(&elsewhere.id).await.unwrap().is_deferred);
}

async fn pending_work_queries(store: &dyn Store) {
  let root = started("c-1");
  store.create_process(&root).await.unwrap();
  let child = started("c-1").with_parent(&root.id, "fn-1");
  store.create_process(&child).await.unwrap();
  let idle = started("c-2");
  store.create_process(&idle).await.unwrap();

  // Only the child has actionable work; the idle root waits on a save.
  store.create_flow_node(&pending_node(&child, 1)).await.unwrap();
  let mut deferred = pending_node(&idle, 1);
  deferred.defer_on(&EntityRef::new("Case", "c-2"));
  store.create_flow_node(&deferred).await.unwrap();

  let roots: Vec<String> = store
    .list_pending_roots()
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.id)
    .collect();
  assert_eq!(roots, vec![root.id.clone()]);

  let scoped: Vec<String> = store
    .list_pending_processes(Some(&root.id))
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.id)
    .collect();
  assert_eq!(scoped, vec![child.id.clone()]);

  assert_eq!(store.list_child_processes(&root.id).await.unwrap().len(), 1);

  store.try_lock_process(&root.id, 1).await.unwrap().unwrap();
  assert!(store.list_pending_roots().await.unwrap().is_empty());
}

async fn entity_upsert(store: &dyn Store) {
  let entity = Entity::new("Case", "c-1", json!({ "status": "Open" }))
    .with_link("account", "Account", "a-1");
  assert!(store.save_entity(&entity).await.unwrap());

  let mut changed = entity.clone();
  changed.set("status", json!("Done"));
  assert!(!store.save_entity(&changed).await.unwrap());

  let loaded = store.get_entity("Case", "c-1").await.unwrap();
  assert_eq!(loaded.get("status"), Some(&json!("Done")));
  assert_eq!(loaded.links.0["account"], EntityRef::new("Account", "a-1"));
  assert!(store.find_entity("Case", "c-9").await.unwrap().is_none());
  assert_eq!(store.list_entities("Case").await.unwrap().len(), 1);
}

async fn job_queue(queue: &dyn JobQueue) {
  let now = Utc::now();
  let later = Job::continuation("p-2", now + Duration::minutes(5));
  let due = Job::continuation("p-1", now - Duration::seconds(1));
  queue.enqueue(&later).await.unwrap();
  queue.enqueue(&due).await.unwrap();

  assert!(queue.has_pending(JobKind::ProcessContinuation, Some("p-1")).await.unwrap());
  assert!(!queue.has_pending(JobKind::GlobalSweep, None).await.unwrap());

  let claimed = queue.claim_due(now, 10).await.unwrap();
  assert_eq!(claimed.len(), 1);
  assert_eq!(claimed[0].id, due.id);
  assert_eq!(claimed[0].status, JobStatus::Running);
  assert_eq!(claimed[0].attempts, 1);
  assert!(!queue.has_pending(JobKind::ProcessContinuation, Some("p-1")).await.unwrap());

  queue.fail(&due.id, "boom").await.unwrap();
  let failed = queue.list_jobs(Some(JobStatus::Failed)).await.unwrap();
  assert_eq!(failed[0].error.as_deref(), Some("boom"));

  let claimed = queue.claim_due(now + Duration::minutes(10), 10).await.unwrap();
  assert_eq!(claimed.len(), 1);
  queue.complete(&later.id).await.unwrap();
  assert!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().is_empty());
}

async fn job_deduplication(queue: &dyn JobQueue) {
  let now = Utc::now();
  assert!(queue.enqueue_if_absent(&Job::continuation("p-1", now)).await.unwrap());
  assert!(!queue.enqueue_if_absent(&Job::continuation("p-1", now)).await.unwrap());
  assert!(queue.enqueue_if_absent(&Job::continuation("p-2", now)).await.unwrap());
  assert!(queue.enqueue_if_absent(&Job::new(JobKind::GlobalSweep, now)).await.unwrap());
  assert!(!queue.enqueue_if_absent(&Job::new(JobKind::GlobalSweep, now)).await.unwrap());

  // Once claimed, the target may be scheduled again.
  queue.claim_due(now, 10).await.unwrap();
  assert!(queue.enqueue_if_absent(&Job::continuation("p-1", now)).await.unwrap());
  assert_eq!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
}

async fn concurrent_enqueue(queue: Arc<dyn JobQueue>) {
  let attempts = (0..16).map(|_| {
    let queue = queue.clone();
    tokio::spawn(async move {
      queue
        .enqueue_if_absent(&Job::continuation("p-1", Utc::now()))
        .await
        .unwrap()
    })
  });

  let mut enqueued = 0;
  for attempt in attempts {
    if attempt.await.unwrap() {
      enqueued += 1;
    }
  }
  assert_eq!(enqueued, 1);
  assert_eq!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
}

async fn concurrent_acquire(store: Arc<dyn Store>) {
  let process = started("c-1");
  store.create_process(&process).await.unwrap();

  let attempts = (0..16).map(|i| {
    let store = store.clone();
    let id = process.id.clone();
    tokio::spawn(async move { store.try_lock_process(&id, 1_000 + i).await.unwrap() })
  });

  let mut acquired = 0;
  for attempt in attempts {
    if attempt.await.unwrap().is_some() {
      acquired += 1;
    }
  }
  assert_eq!(acquired, 1);
}

#[tokio::test]
async fn test_memory_store_contract() {
  process_round_trip(&MemoryStore::new()).await;
  lock_protocol(&MemoryStore::new()).await;
  stale_lock_release(&MemoryStore::new()).await;
  flow_node_lifecycle(&MemoryStore::new()).await;
  removed_process_is_sealed(&MemoryStore::new()).await;
  deferred_clearing_is_bounded(&MemoryStore::new()).await;
  pending_work_queries(&MemoryStore::new()).await;
  entity_upsert(&MemoryStore::new()).await;
  job_queue(&MemoryJobQueue::new()).await;
  job_deduplication(&MemoryJobQueue::new()).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
  process_round_trip(&sqlite().await).await;
  lock_protocol(&sqlite().await).await;
  stale_lock_release(&sqlite().await).await;
  flow_node_lifecycle(&sqlite().await).await;
  removed_process_is_sealed(&sqlite().await).await;
  deferred_clearing_is_bounded(&sqlite().await).await;
  pending_work_queries(&sqlite().await).await;
  entity_upsert(&sqlite().await).await;
  job_queue(&sqlite().await).await;
  job_deduplication(&sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_yields_one_owner() {
  concurrent_acquire(Arc::new(MemoryStore::new())).await;

  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("trellis.db").display());
  let store = SqliteStore::connect(&url).await.unwrap();
  store.migrate().await.unwrap();
  concurrent_acquire(Arc::new(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_keeps_one_pending_job() {
  concurrent_enqueue(Arc::new(MemoryJobQueue::new())).await;

  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("trellis.db").display());
  let store = SqliteStore::connect(&url).await.unwrap();
  store.migrate().await.unwrap();
  concurrent_enqueue(Arc::new(store)).await;
}
