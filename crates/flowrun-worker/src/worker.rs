//! The worker loop.
//!
//! A `Worker` registers itself, consumes the work items of its group, runs
//! them through a [`TaskRunner`] and reports every change of the task runs
//! on the result queue. The registry lease taken before a task starts lets
//! another worker pick the task up if this one dies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowrun_config::{Task, TaskKind};
use flowrun_model::{
  ExecutionKilled, KillState, StateType, TaskRun, TaskRunAttempt, WorkerInstance,
  WorkerJobRunning, WorkerTask, WorkerTaskResult, worker_consumer_group,
};
use flowrun_queue::{MalformedMessage, Queues, StartAt, Subscription};
use flowrun_registry::Registry;
use flowrun_resolver::{MiniJinjaRenderer, Renderer, render_value};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::WorkerConfig;
use crate::error::{TaskError, WorkerError};
use crate::task::{BuiltinTaskRunner, TaskContext, TaskRunner};

/// How a task run ended on this worker.
enum Outcome {
  Done(Result<Map<String, Value>, TaskError>),
  Cancelled,
}

/// Runs the runnable tasks dispatched by the executors.
///
/// # Usage
///
/// ```ignore
/// let worker = Arc::new(Worker::new(registry, queues, WorkerConfig::default()));
///
/// let cancel = CancellationToken::new();
/// worker.run(cancel).await?;
/// ```
pub struct Worker {
  registry: Arc<Registry>,
  queues: Queues,
  runner: Arc<dyn TaskRunner>,
  renderer: Arc<dyn Renderer>,
  config: WorkerConfig,
  hostname: String,
  semaphore: Arc<Semaphore>,
  /// Executions killed since the worker started.
  killed: RwLock<HashSet<String>>,
  /// Task runs in progress: task run id to execution id and stop token.
  running: Mutex<HashMap<String, (String, CancellationToken)>>,
  instance: RwLock<Option<WorkerInstance>>,
}

impl Worker {
  pub fn new(registry: Arc<Registry>, queues: Queues, config: WorkerConfig) -> Self {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    Self {
      registry,
      queues,
      runner: Arc::new(BuiltinTaskRunner::new()),
      renderer: Arc::new(MiniJinjaRenderer::new()),
      semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
      config,
      hostname,
      killed: RwLock::new(HashSet::new()),
      running: Mutex::new(HashMap::new()),
      instance: RwLock::new(None),
    }
  }

  pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
    self.runner = runner;
    self
  }

  pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
    self.renderer = renderer;
    self
  }

  pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
    self.hostname = hostname.into();
    self
  }

  /// The registered instance, once [`Worker::run`] started.
  pub async fn instance(&self) -> Option<WorkerInstance> {
    self.instance.read().await.clone()
  }

  /// Register, consume work items and send heartbeats until cancelled.
  ///
  /// On cancellation the tasks in progress are stopped without reporting,
  /// and unregistering hands their leases back to the other workers.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), WorkerError> {
    let instance = self
      .registry
      .register(&self.hostname, self.config.worker_group.clone())
      .await?;
    let worker_uuid = instance.worker_uuid;
    *self.instance.write().await = Some(instance);
    info!(
      worker_uuid = %worker_uuid,
      worker_group = ?self.config.worker_group,
      concurrency = self.config.concurrency,
      "worker_started"
    );

    let kills = self.subscribe_kills();
    let tasks = self.subscribe_tasks(cancel.clone());

    let mut interval = tokio::time::interval(self.registry.config().heartbeat_interval());
    interval.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = interval.tick() => self.heartbeat().await,
      }
    }

    tasks.shutdown().await;
    kills.shutdown().await;

    // every permit back means every spawned task returned
    let permits = self.config.concurrency.max(1) as u32;
    if let Ok(all) = self.semaphore.acquire_many(permits).await {
      drop(all);
    }

    self.registry.unregister(worker_uuid).await?;
    info!(worker_uuid = %worker_uuid, "worker_stopped");
    Ok(())
  }

  async fn heartbeat(&self) {
    let Some(instance) = self.instance().await else {
      return;
    };

    match self.registry.heartbeat(&instance).await {
      Ok(updated) => *self.instance.write().await = Some(updated),
      Err(e) => error!(worker_uuid = %instance.worker_uuid, error = %e, "heartbeat_failed"),
    }
  }

  fn subscribe_kills(self: &Arc<Self>) -> Subscription {
    let worker = self.clone();
    self.queues.execution_killed.broadcast(
      StartAt::Latest,
      move |message: Result<ExecutionKilled, MalformedMessage>| {
        let worker = worker.clone();
        async move {
          if let Ok(killed) = message {
            if killed.state == KillState::Executed {
              worker.on_killed(&killed.execution_id).await;
            }
          }
        }
      },
    )
  }

  async fn on_killed(&self, execution_id: &str) {
    self.killed.write().await.insert(execution_id.to_string());

    let running = self.running.lock().await;
    let stopped = running
      .values()
      .filter(|(id, _)| id == execution_id)
      .inspect(|(_, token)| token.cancel())
      .count();
    info!(execution_id = %execution_id, stopped, "execution_kill_received");
  }

  fn subscribe_tasks(self: &Arc<Self>, cancel: CancellationToken) -> Subscription {
    let worker = self.clone();
    let group = worker_consumer_group(self.config.worker_group.as_deref());
    self.queues.worker_task.receive(
      group.clone(),
      move |message: Result<WorkerTask, MalformedMessage>| {
        let worker = worker.clone();
        let group = group.clone();
        let cancel = cancel.clone();
        async move {
          match message {
            Ok(worker_task) if worker_task.consumer_group() != group => {
              trace!(
                task_run_id = %worker_task.task_run.id,
                consumer_group = %worker_task.consumer_group(),
                "worker_task_skipped"
              );
            }
            Ok(worker_task) => {
              let task_run_id = worker_task.task_run.id.clone();
              if let Err(e) = worker.accept(worker_task, cancel).await {
                error!(task_run_id = %task_run_id, error = %e, "worker_task_handling_failed");
              }
            }
            Err(malformed) => {
              if let Err(e) = worker.reject(&malformed).await {
                error!(offset = malformed.offset, error = %e, "malformed_worker_task_handling_failed");
              }
            }
          }
        }
      },
    )
  }

  /// Take the lease on a work item and start it in the background once a
  /// slot is free.
  async fn accept(
    self: &Arc<Self>,
    worker_task: WorkerTask,
    cancel: CancellationToken,
  ) -> Result<(), WorkerError> {
    let task_run = &worker_task.task_run;

    if self.killed.read().await.contains(&task_run.execution_id) {
      debug!(task_run_id = %task_run.id, "worker_task_of_killed_execution");
      let killed = close(task_run, StateType::Killed, StateType::Killed);
      return self.report(&killed).await;
    }

    let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
      return Ok(());
    };

    let Some(instance) = self.instance().await else {
      return Ok(());
    };
    self
      .registry
      .save_lease(&WorkerJobRunning::of(&worker_task, instance.worker_uuid))
      .await?;

    let token = cancel.child_token();
    self.running.lock().await.insert(
      task_run.id.clone(),
      (task_run.execution_id.clone(), token.clone()),
    );

    let worker = self.clone();
    tokio::spawn(async move {
      let task_run_id = worker_task.task_run.id.clone();
      if let Err(e) = worker.run_task(worker_task, token).await {
        error!(task_run_id = %task_run_id, error = %e, "task_run_failed_to_report");
      }
      worker.running.lock().await.remove(&task_run_id);
      drop(permit);
    });

    Ok(())
  }

  /// A work item that can't be decoded fails its task run, when the task
  /// run itself can still be read.
  async fn reject(&self, malformed: &MalformedMessage) -> Result<(), WorkerError> {
    error!(offset = malformed.offset, error = %malformed.error, "malformed_worker_task");

    let task_run = serde_json::from_str::<Value>(&malformed.payload)
      .ok()
      .and_then(|mut payload| payload.get_mut("task_run").map(Value::take))
      .and_then(|task_run| serde_json::from_value::<TaskRun>(task_run).ok());

    match task_run {
      Some(task_run) => self.report(&task_run.fail()).await,
      None => {
        warn!(offset = malformed.offset, "malformed_worker_task_dropped");
        Ok(())
      }
    }
  }

  #[instrument(
    name = "run_task",
    skip(self, worker_task, token),
    fields(
      execution_id = %worker_task.task_run.execution_id,
      task_run_id = %worker_task.task_run.id,
      task = %worker_task.task_run.describe(),
    )
  )]
  async fn run_task(
    &self,
    worker_task: WorkerTask,
    token: CancellationToken,
  ) -> Result<(), WorkerError> {
    let task_run = &worker_task.task_run;

    if let Some(date) = task_run.next_retry_date {
      let wait = (date - Utc::now()).to_std().unwrap_or_default();
      debug!(wait_ms = wait.as_millis() as u64, "waiting_for_retry");
      tokio::select! {
        _ = token.cancelled() => return self.on_cancelled(task_run).await,
        _ = tokio::time::sleep(wait) => {}
      }
    }

    let running = start_attempt(task_run);
    self.report(&running).await?;

    let context = TaskContext {
      execution_id: running.execution_id.clone(),
      task_run_id: running.id.clone(),
      task_id: running.task_id.clone(),
      value: running.value.clone(),
      attempt: running.attempt_count(),
    };
    debug!(attempt = context.attempt, "task_started");

    let outcome = tokio::select! {
      _ = token.cancelled() => Outcome::Cancelled,
      result = self.execute(&worker_task, &context, token.clone()) => Outcome::Done(result),
    };

    let finished = match outcome {
      Outcome::Cancelled => return self.on_cancelled(&running).await,
      Outcome::Done(result) => finish(&worker_task.task, running, result),
    };

    info!(
      state = %finished.state.current,
      attempt = finished.attempt_count(),
      "task_finished"
    );
    self.report(&finished).await?;
    if finished.state.is_terminated() {
      self.release(&finished).await?;
    }

    Ok(())
  }

  async fn execute(
    &self,
    worker_task: &WorkerTask,
    context: &TaskContext,
    token: CancellationToken,
  ) -> Result<Map<String, Value>, TaskError> {
    let task = &worker_task.task;
    let TaskKind::Runnable(runnable) = &task.kind else {
      return Err(TaskError::NotRunnable(task.id.clone()));
    };

    let mut properties = Map::with_capacity(runnable.properties.len());
    for (name, value) in &runnable.properties {
      let rendered = render_value(self.renderer.as_ref(), value, &worker_task.variables)?;
      properties.insert(name.clone(), rendered);
    }

    let run = self.runner.run(task, properties, context, token);
    match self.config.timeout(task.timeout_ms) {
      Some(timeout) => tokio::time::timeout(timeout, run)
        .await
        .unwrap_or(Err(TaskError::Timeout(timeout))),
      None => run.await,
    }
  }

  /// The stop token fired: the execution was killed, or the worker is
  /// shutting down and leaves the task run to its lease.
  async fn on_cancelled(&self, task_run: &TaskRun) -> Result<(), WorkerError> {
    if !self.killed.read().await.contains(&task_run.execution_id) {
      info!(task_run_id = %task_run.id, "task_abandoned_on_shutdown");
      return Ok(());
    }

    info!(task_run_id = %task_run.id, "task_killed");
    self
      .report(&close(task_run, StateType::Killed, StateType::Killed))
      .await?;
    self.release(task_run).await
  }

  /// Drop this worker's lease on the task run.
  async fn release(&self, task_run: &TaskRun) -> Result<(), WorkerError> {
    if let Some(instance) = self.instance().await {
      self
        .registry
        .delete_lease(&task_run.id, instance.worker_uuid)
        .await?;
    }
    Ok(())
  }

  async fn report(&self, task_run: &TaskRun) -> Result<(), WorkerError> {
    let mut result = WorkerTaskResult::new(task_run.clone());
    if let Some(instance) = self.instance().await {
      result = result.with_worker(instance.worker_uuid);
    }
    self.queues.worker_task_result.emit(&result).await?;
    trace!(task_run_id = %task_run.id, state = %task_run.state.current, "task_run_reported");
    Ok(())
  }
}

/// Open a new RUNNING attempt.
fn start_attempt(task_run: &TaskRun) -> TaskRun {
  let mut attempts = task_run.attempts.clone();
  attempts.push(TaskRunAttempt::of(StateType::Running));

  let mut running = task_run.with_attempts(attempts);
  if running.state.current != StateType::Running {
    running = running.with_state(StateType::Running);
  }
  running.next_retry_date = None;
  running
}

/// Close the open attempt with `attempt`, and the task run with `state`.
fn close(task_run: &TaskRun, attempt: StateType, state: StateType) -> TaskRun {
  let mut attempts = task_run.attempts.clone();
  match attempts.last_mut() {
    Some(last) if !last.state.is_terminated() => *last = last.with_state(attempt),
    _ => attempts.push(TaskRunAttempt::of(attempt)),
  }

  task_run.with_attempts(attempts).with_state(state)
}

/// The task run after its attempt returned `result`.
fn finish(task: &Task, running: TaskRun, result: Result<Map<String, Value>, TaskError>) -> TaskRun {
  match result {
    Ok(outputs) => {
      let retried = running.attempt_count() > 1;
      let state = if retried && task.retry.as_ref().is_some_and(|r| r.warning_on_retry) {
        StateType::Warning
      } else {
        StateType::Success
      };
      close(&running, StateType::Success, state).with_outputs(outputs)
    }
    Err(e) => {
      warn!(error = %e, attempt = running.attempt_count(), "task_attempt_failed");

      if let Some(policy) = &task.retry {
        let attempts = running.attempt_count();
        let elapsed = running
          .attempts
          .first()
          .and_then(|first| first.state.start_date())
          .and_then(|start| (Utc::now() - start).to_std().ok())
          .unwrap_or(Duration::ZERO);

        if policy.should_retry(attempts, elapsed) {
          let delay = policy.next_delay(attempts);
          let date = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
          debug!(delay_ms = delay.as_millis() as u64, "task_retry_scheduled");
          return running.fail().retry(date);
        }
      }

      if task.allow_failure {
        close(&running, StateType::Failed, StateType::Warning)
      } else {
        running.fail()
      }
    }
  }
}
