//! A worker that stops heartbeating loses its partitions and its leased work
//! is handed out again.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flowrun_config::{Flow, Task};
use flowrun_model::{
  Execution, ResolvedTask, StateType, TaskRun, TaskRunAttempt, WorkerInstance, WorkerJobRunning,
  WorkerTask,
};
use flowrun_queue::{MemoryQueue, Queue, QueueBackend, QueueConfig, QueueType};
use flowrun_registry::{
  InstanceRepository, MemoryInstanceRepository, Registry, RegistryConfig, RegistryError,
  SqliteInstanceRepository,
};
use uuid::Uuid;
use tempfile::TempDir;

fn worker_task(execution: &Execution, flow: &Flow, index: usize) -> WorkerTask {
  let task = flow.tasks[index].clone();
  let task_run = TaskRun::of(execution, &ResolvedTask::of(&flow.tasks)[index])
    .with_state(StateType::Running)
    .with_attempts(vec![TaskRunAttempt::of(StateType::Running)]);

  WorkerTask {
    task_run,
    task,
    variables: serde_json::json!({}),
  }
}

fn instance(partitions: &[i32], heartbeat_age: chrono::Duration) -> WorkerInstance {
  let mut instance = WorkerInstance::new("host", None);
  instance.partitions = partitions.iter().copied().collect();
  instance.last_heartbeat = Utc::now() - heartbeat_age;
  instance
}

async fn dead_worker_is_evicted(repository: Arc<dyn InstanceRepository>) {
  let backend = Arc::new(MemoryQueue::new());
  let queue: Queue<WorkerTask> = Queue::new(backend.clone(), QueueConfig::default());
  let config = RegistryConfig {
    partitions: 8,
    ..Default::default()
  };
  let registry = Registry::new(repository.clone(), queue, config.clone());

  let stale = config.expiry() * 2;
  let alive_a = instance(&[0, 4, 5], chrono::Duration::zero());
  let dead = instance(&[1, 2, 3], stale);
  let alive_b = instance(&[6, 7], chrono::Duration::zero());
  for instance in [&alive_a, &dead, &alive_b] {
    repository.save_instance(instance).await.unwrap();
  }

  let flow = Flow::new(
    "io.flowrun",
    "eviction",
    vec![
      Task::runnable("a", "sleep"),
      Task::runnable("b", "sleep"),
      Task::runnable("c", "sleep"),
    ],
  );
  let execution = Execution::new(&flow, Default::default());
  let leased: Vec<WorkerTask> = (0..3).map(|i| worker_task(&execution, &flow, i)).collect();
  for task in &leased {
    repository
      .save_lease(&WorkerJobRunning::of(task, dead.worker_uuid))
      .await
      .unwrap();
  }
  // a lease of a live worker stays put
  let kept = worker_task(&execution, &flow, 0);
  repository
    .save_lease(&WorkerJobRunning::of(&kept, alive_a.worker_uuid))
    .await
    .unwrap();

  let evicted = registry.check_liveness(Utc::now()).await.unwrap();
  assert_eq!(evicted, vec![dead.worker_uuid]);

  // the record is gone
  let instances = repository.list_instances().await.unwrap();
  assert_eq!(instances.len(), 2);
  assert!(instances.iter().all(|i| i.worker_uuid != dead.worker_uuid));

  // every partition owned exactly once
  let mut owned: Vec<i32> = instances
    .iter()
    .flat_map(|i| i.partitions.iter().copied())
    .collect();
  owned.sort();
  assert_eq!(owned, (0..8).collect::<Vec<_>>());
  let b = instances
    .iter()
    .find(|i| i.worker_uuid == alive_b.worker_uuid)
    .unwrap();
  assert!(b.partitions.is_superset(&BTreeSet::from([6, 7])));

  // one work item per lease, for the same task runs
  let records = backend
    .read_after(QueueType::WorkerTask, 0, 100)
    .await
    .unwrap();
  assert_eq!(records.len(), 3);
  let mut resent_ids: Vec<String> = records
    .iter()
    .map(|r| {
      let task: WorkerTask = serde_json::from_str(&r.payload).unwrap();
      assert_eq!(task.task_run.state.current, StateType::Running);
      assert_eq!(
        task.task_run.last_attempt().unwrap().state.current,
        StateType::Killed
      );
      task.task_run.id
    })
    .collect();
  resent_ids.sort();
  let mut expected: Vec<String> = leased.iter().map(|t| t.task_run.id.clone()).collect();
  expected.sort();
  assert_eq!(resent_ids, expected);

  assert!(repository.leases_of(dead.worker_uuid).await.unwrap().is_empty());
  assert_eq!(
    repository.leases_of(alive_a.worker_uuid).await.unwrap().len(),
    1
  );
}

#[tokio::test]
async fn test_dead_worker_is_evicted_in_memory() {
  dead_worker_is_evicted(Arc::new(MemoryInstanceRepository::new())).await;
}

#[tokio::test]
async fn test_dead_worker_is_evicted_sqlite() {
  let dir = TempDir::new().unwrap();
  let pool = flowrun_store::connect(&dir.path().join("flowrun.db"))
    .await
    .unwrap();
  flowrun_store::migrate(&pool).await.unwrap();

  dead_worker_is_evicted(Arc::new(SqliteInstanceRepository::new(pool))).await;
}

#[tokio::test]
async fn test_last_worker_leaves_partitions_unowned() {
  let repository: Arc<dyn InstanceRepository> = Arc::new(MemoryInstanceRepository::new());
  let queue: Queue<WorkerTask> = Queue::new(Arc::new(MemoryQueue::new()), QueueConfig::default());
  let registry = Registry::new(repository.clone(), queue, RegistryConfig::default());

  let only = registry.register("host", None).await.unwrap();
  registry.unregister(only.worker_uuid).await.unwrap();

  // the next worker picks everything up
  let next = registry.register("host", None).await.unwrap();
  assert_eq!(next.partitions.len(), RegistryConfig::default().partitions as usize);
}

/// A repository whose listing still shows the instances as they were when
/// it was created, like another process that read them a moment earlier.
struct StaleListing {
  inner: Arc<dyn InstanceRepository>,
  listed: Vec<WorkerInstance>,
}

#[async_trait]
impl InstanceRepository for StaleListing {
  async fn list_instances(&self) -> Result<Vec<WorkerInstance>, RegistryError> {
    Ok(self.listed.clone())
  }

  async fn find_instance(
    &self,
    worker_uuid: Uuid,
  ) -> Result<Option<WorkerInstance>, RegistryError> {
    self.inner.find_instance(worker_uuid).await
  }

  async fn save_instance(&self, instance: &WorkerInstance) -> Result<(), RegistryError> {
    self.inner.save_instance(instance).await
  }

  async fn delete_instance(&self, worker_uuid: Uuid) -> Result<bool, RegistryError> {
    self.inner.delete_instance(worker_uuid).await
  }

  async fn save_lease(&self, lease: &WorkerJobRunning) -> Result<(), RegistryError> {
    self.inner.save_lease(lease).await
  }

  async fn delete_lease(
    &self,
    task_run_id: &str,
    worker_uuid: Uuid,
  ) -> Result<(), RegistryError> {
    self.inner.delete_lease(task_run_id, worker_uuid).await
  }

  async fn leases_of(&self, worker_uuid: Uuid) -> Result<Vec<WorkerJobRunning>, RegistryError> {
    self.inner.leases_of(worker_uuid).await
  }
}

#[tokio::test]
async fn test_two_registries_re_emit_a_dead_worker_once() {
  let dir = TempDir::new().unwrap();
  let pool = flowrun_store::connect(&dir.path().join("flowrun.db"))
    .await
    .unwrap();
  flowrun_store::migrate(&pool).await.unwrap();
  let shared: Arc<dyn InstanceRepository> = Arc::new(SqliteInstanceRepository::new(pool));

  let backend = Arc::new(MemoryQueue::new());
  let config = RegistryConfig::default();
  let dead = instance(&[0, 1], config.expiry() * 2);
  shared.save_instance(&dead).await.unwrap();

  let flow = Flow::new(
    "io.flowrun",
    "twice",
    vec![Task::runnable("a", "sleep"), Task::runnable("b", "sleep")],
  );
  let execution = Execution::new(&flow, Default::default());
  for index in 0..2 {
    shared
      .save_lease(&WorkerJobRunning::of(
        &worker_task(&execution, &flow, index),
        dead.worker_uuid,
      ))
      .await
      .unwrap();
  }

  // the second registry saw the dead instance before the first deleted it
  let stale = Arc::new(StaleListing {
    inner: shared.clone(),
    listed: shared.list_instances().await.unwrap(),
  });
  let first = Registry::new(
    shared.clone(),
    Queue::new(backend.clone(), QueueConfig::default()),
    config.clone(),
  );
  let second = Registry::new(
    stale,
    Queue::new(backend.clone(), QueueConfig::default()),
    config,
  );

  // the first one deleted the record and has not released the leases yet
  assert!(shared.delete_instance(dead.worker_uuid).await.unwrap());
  assert!(second.check_liveness(Utc::now()).await.unwrap().is_empty());
  assert!(
    backend
      .read_after(QueueType::WorkerTask, 0, 100)
      .await
      .unwrap()
      .is_empty()
  );
  assert_eq!(shared.leases_of(dead.worker_uuid).await.unwrap().len(), 2);

  // a registry evicting on its own re-emits every lease once
  shared.save_instance(&dead).await.unwrap();
  let evicted = first.check_liveness(Utc::now()).await.unwrap();
  assert_eq!(evicted, vec![dead.worker_uuid]);
  assert!(first.check_liveness(Utc::now()).await.unwrap().is_empty());
  assert_eq!(
    backend
      .read_after(QueueType::WorkerTask, 0, 100)
      .await
      .unwrap()
      .len(),
    2
  );
}
