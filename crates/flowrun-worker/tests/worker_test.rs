//! Executors and workers running together over the queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flowrun_config::{Flow, RetryPolicy, Task};
use flowrun_dedup::{Deduplicator, MemoryDeduplicator, SqliteDeduplicator};
use flowrun_executor::{
  ChannelNotifier, ExecutionEvent, ExecutionService, Executor, FlowCache,
};
use flowrun_model::{Execution, StateType};
use flowrun_queue::{MemoryQueue, QueueBackend, QueueConfig, QueueType, Queues, SqliteQueue};
use flowrun_registry::{
  InstanceRepository, MemoryInstanceRepository, Registry, RegistryConfig,
  SqliteInstanceRepository,
};
use flowrun_store::{ExecutionStore, MemoryExecutionStore, SqliteExecutionStore};
use flowrun_worker::{BuiltinTaskRunner, TaskContext, TaskError, TaskRunner, Worker, WorkerConfig};
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn queue_config() -> QueueConfig {
  QueueConfig {
    poll_interval_ms: 10,
    poll_jitter_ms: 5,
    ..Default::default()
  }
}

fn registry_config() -> RegistryConfig {
  RegistryConfig {
    heartbeat_interval_ms: 100,
    liveness_check_interval_ms: 100,
    ..Default::default()
  }
}

struct Cluster {
  service: ExecutionService,
  queues: Queues,
  registry: Arc<Registry>,
  events: mpsc::UnboundedReceiver<ExecutionEvent>,
  cancel: CancellationToken,
  handles: Vec<tokio::task::JoinHandle<()>>,
  _dir: Option<TempDir>,
}

impl Cluster {
  async fn memory() -> Self {
    Self::start(
      Arc::new(MemoryQueue::new()),
      Arc::new(MemoryExecutionStore::new()),
      Arc::new(MemoryDeduplicator::new()),
      Arc::new(MemoryInstanceRepository::new()),
      None,
    )
  }

  async fn sqlite() -> Self {
    let dir = TempDir::new().unwrap();
    let pool = flowrun_store::connect(&dir.path().join("flowrun.db"))
      .await
      .unwrap();
    flowrun_store::migrate(&pool).await.unwrap();

    Self::start(
      Arc::new(SqliteQueue::new(pool.clone())),
      Arc::new(SqliteExecutionStore::new(pool.clone())),
      Arc::new(SqliteDeduplicator::new(pool.clone())),
      Arc::new(SqliteInstanceRepository::new(pool)),
      Some(dir),
    )
  }

  fn start(
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn ExecutionStore>,
    dedup: Arc<dyn Deduplicator>,
    repository: Arc<dyn InstanceRepository>,
    dir: Option<TempDir>,
  ) -> Self {
    let queues = Queues::new(backend, queue_config());
    let flows = Arc::new(FlowCache::from_queue(queues.flow.clone()));
    let registry = Arc::new(Registry::new(
      repository,
      queues.worker_task.clone(),
      registry_config(),
    ));
    let (tx, events) = mpsc::unbounded_channel();

    let executor = Arc::new(
      Executor::new(flows.clone(), store.clone(), dedup, registry.clone(), queues.clone())
        .with_notifier(Arc::new(ChannelNotifier::new(tx))),
    );
    let cancel = CancellationToken::new();
    let handles = vec![tokio::spawn(executor.run(cancel.child_token()))];

    Self {
      service: ExecutionService::new(store, flows, queues.clone()),
      queues,
      registry,
      events,
      cancel,
      handles,
      _dir: dir,
    }
  }

  fn worker(&mut self, config: WorkerConfig, runner: Arc<dyn TaskRunner>) {
    let worker = Arc::new(
      Worker::new(self.registry.clone(), self.queues.clone(), config).with_runner(runner),
    );
    let cancel = self.cancel.child_token();
    self.handles.push(tokio::spawn(async move {
      worker.run(cancel).await.unwrap();
    }));
  }

  fn builtin_worker(&mut self) {
    self.worker(WorkerConfig::default(), Arc::new(BuiltinTaskRunner::new()));
  }

  async fn submit(&self, flow: &Flow) -> String {
    self.service.publish_flow(flow).await.unwrap();
    self
      .service
      .submit(flow, Map::new())
      .await
      .unwrap()
      .id
  }

  /// Wait for an event matching `predicate`.
  async fn wait_for<F>(&mut self, predicate: F) -> ExecutionEvent
  where
    F: Fn(&ExecutionEvent) -> bool,
  {
    tokio::time::timeout(Duration::from_secs(20), async {
      loop {
        let event = self.events.recv().await.expect("notifier dropped");
        if predicate(&event) {
          return event;
        }
      }
    })
    .await
    .expect("timed out waiting for an execution event")
  }

  async fn terminated(&mut self, id: &str) -> Execution {
    let event = self
      .wait_for(|event| {
        matches!(event, ExecutionEvent::ExecutionTerminated { execution } if execution.id == id)
      })
      .await;
    match event {
      ExecutionEvent::ExecutionTerminated { execution } => *execution,
      _ => unreachable!(),
    }
  }

  async fn stop(self) {
    self.cancel.cancel();
    for handle in self.handles {
      handle.await.unwrap();
    }
  }
}

fn states(execution: &Execution) -> Vec<(&str, StateType)> {
  execution
    .task_run_list
    .iter()
    .map(|t| (t.task_id.as_str(), t.state.current))
    .collect()
}

/// Fails until its attempt number reaches `succeed_at`.
struct FlakyRunner {
  succeed_at: u32,
  calls: AtomicU32,
}

#[async_trait]
impl TaskRunner for FlakyRunner {
  async fn run(
    &self,
    _task: &Task,
    _properties: Map<String, Value>,
    context: &TaskContext,
    _cancel: CancellationToken,
  ) -> Result<Map<String, Value>, TaskError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if context.attempt < self.succeed_at {
      return Err(TaskError::Failed(format!("attempt {}", context.attempt)));
    }
    Ok(Map::new())
  }
}

/// Reports the name it was given.
struct NamedRunner(&'static str);

#[async_trait]
impl TaskRunner for NamedRunner {
  async fn run(
    &self,
    _task: &Task,
    _properties: Map<String, Value>,
    _context: &TaskContext,
    _cancel: CancellationToken,
  ) -> Result<Map<String, Value>, TaskError> {
    let mut outputs = Map::new();
    outputs.insert("ran_on".to_string(), json!(self.0));
    Ok(outputs)
  }
}

fn sequential_flow() -> Flow {
  Flow::new(
    "io.flowrun",
    "hello",
    vec![
      Task::runnable("first", "return").with_property("format", json!("hello")),
      Task::runnable("second", "return")
        .with_property("format", json!("{{ outputs.first.value }} world")),
    ],
  )
}

async fn run_sequential(mut cluster: Cluster) {
  cluster.builtin_worker();
  let id = cluster.submit(&sequential_flow()).await;

  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.state.current, StateType::Success);
  assert_eq!(
    states(&execution),
    vec![("first", StateType::Success), ("second", StateType::Success)]
  );
  assert_eq!(
    execution.task_run_list[1].outputs.get("value"),
    Some(&json!("hello world"))
  );
  cluster.stop().await;
}

#[tokio::test]
async fn test_sequential_flow_in_memory() {
  run_sequential(Cluster::memory().await).await;
}

#[tokio::test]
async fn test_sequential_flow_on_sqlite() {
  run_sequential(Cluster::sqlite().await).await;
}

#[tokio::test]
async fn test_failed_attempts_are_retried() {
  let mut cluster = Cluster::memory().await;
  let runner = Arc::new(FlakyRunner {
    succeed_at: 3,
    calls: AtomicU32::new(0),
  });
  cluster.worker(WorkerConfig::default(), runner.clone());

  let mut task = Task::runnable("flaky", "custom");
  task.retry = Some(RetryPolicy::constant(Duration::from_millis(20), 5));
  let flow = Flow::new("io.flowrun", "retry", vec![task]);
  let id = cluster.submit(&flow).await;

  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.state.current, StateType::Success);
  let task_run = &execution.task_run_list[0];
  let attempts: Vec<StateType> = task_run.attempts.iter().map(|a| a.state.current).collect();
  assert_eq!(
    attempts,
    vec![StateType::Failed, StateType::Failed, StateType::Success]
  );
  assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
  cluster.stop().await;
}

#[tokio::test]
async fn test_success_after_retry_can_warn() {
  let mut cluster = Cluster::memory().await;
  cluster.worker(
    WorkerConfig::default(),
    Arc::new(FlakyRunner {
      succeed_at: 2,
      calls: AtomicU32::new(0),
    }),
  );

  let mut policy = RetryPolicy::constant(Duration::from_millis(10), 3);
  policy.warning_on_retry = true;
  let mut task = Task::runnable("flaky", "custom");
  task.retry = Some(policy);
  let flow = Flow::new("io.flowrun", "warn", vec![task]);
  let id = cluster.submit(&flow).await;

  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.task_run_list[0].state.current, StateType::Warning);
  assert_eq!(execution.state.current, StateType::Warning);
  cluster.stop().await;
}

#[tokio::test]
async fn test_task_past_its_timeout_fails() {
  let mut cluster = Cluster::memory().await;
  cluster.builtin_worker();

  let mut task = Task::runnable("slow", "sleep").with_property("duration_ms", json!(30_000));
  task.timeout_ms = Some(50);
  let flow = Flow::new("io.flowrun", "timeout", vec![task]);
  let id = cluster.submit(&flow).await;

  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.state.current, StateType::Failed);
  assert_eq!(states(&execution), vec![("slow", StateType::Failed)]);
  cluster.stop().await;
}

#[tokio::test]
async fn test_kill_stops_running_task() {
  let mut cluster = Cluster::memory().await;
  cluster.builtin_worker();

  let flow = Flow::new(
    "io.flowrun",
    "kill",
    vec![
      Task::runnable("slow", "sleep").with_property("duration_ms", json!(30_000)),
      Task::runnable("never", "log"),
    ],
  );
  let id = cluster.submit(&flow).await;
  cluster
    .wait_for(|event| {
      matches!(
        event,
        ExecutionEvent::TaskRunStateChanged { state: StateType::Running, .. }
      )
    })
    .await;

  cluster.service.kill(&id).await.unwrap();
  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.state.current, StateType::Killed);
  assert_eq!(states(&execution), vec![("slow", StateType::Killed)]);
  cluster.stop().await;
}

#[tokio::test]
async fn test_tasks_go_to_their_worker_group() {
  let mut cluster = Cluster::memory().await;
  cluster.worker(WorkerConfig::default(), Arc::new(NamedRunner("default")));
  cluster.worker(
    WorkerConfig {
      worker_group: Some("gpu".to_string()),
      ..Default::default()
    },
    Arc::new(NamedRunner("gpu")),
  );

  let mut train = Task::runnable("train", "custom");
  train.worker_group = Some("gpu".to_string());
  let flow = Flow::new(
    "io.flowrun",
    "groups",
    vec![Task::runnable("prepare", "custom"), train],
  );
  let id = cluster.submit(&flow).await;

  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.state.current, StateType::Success);
  let ran_on: Vec<&Value> = execution
    .task_run_list
    .iter()
    .filter_map(|t| t.outputs.get("ran_on"))
    .collect();
  assert_eq!(ran_on, vec![&json!("default"), &json!("gpu")]);
  cluster.stop().await;
}

#[tokio::test]
async fn test_malformed_work_item_fails_its_task_run() {
  let mut cluster = Cluster::memory().await;
  cluster.builtin_worker();

  // no worker serves this group, only the broken copy gets handled
  let mut task = Task::runnable("a", "log");
  task.worker_group = Some("nobody".to_string());
  let flow = Flow::new("io.flowrun", "malformed", vec![task]);
  let id = cluster.submit(&flow).await;

  let created = cluster
    .wait_for(|event| matches!(event, ExecutionEvent::TaskRunCreated { .. }))
    .await;
  let ExecutionEvent::TaskRunCreated { task_run_id, .. } = created else {
    unreachable!()
  };

  let work = loop {
    let records = cluster.queues.worker_task.read_after(0).await.unwrap();
    if let Some((_, Ok(work))) = records.into_iter().next() {
      break work;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  };
  assert_eq!(work.task_run.id, task_run_id);

  let mut payload = serde_json::to_value(&work).unwrap();
  payload["task"] = json!(42);
  cluster
    .queues
    .worker_task
    .backend()
    .emit(QueueType::WorkerTask, &task_run_id, payload.to_string())
    .await
    .unwrap();

  let execution = cluster.terminated(&id).await;

  assert_eq!(execution.state.current, StateType::Failed);
  assert_eq!(states(&execution), vec![("a", StateType::Failed)]);
  cluster.stop().await;
}
