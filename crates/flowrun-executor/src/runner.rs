//! The executor loop.
//!
//! The `Executor` consumes submitted executions, worker results and kill
//! requests. Each event is applied to the stored execution under a
//! per-execution lock, the execution is processed until it settles, stored
//! with an optimistic version check, then the work it waits for is handed to
//! the workers.

use std::sync::Arc;
use std::time::Duration;

use flowrun_dedup::{Deduplicator, nexts_key, work_key};
use flowrun_model::{
  Execution, ExecutionKilled, KillState, ModelError, StateType, WorkerTaskResult,
};
use flowrun_queue::{MalformedMessage, Queues, Subscription};
use flowrun_registry::Registry;
use flowrun_resolver::{MiniJinjaRenderer, Renderer};
use flowrun_store::{ExecutionStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier, diff};
use crate::flows::FlowRepository;
use crate::lock::KeyedLock;
use crate::process::{Processed, process};

/// Consumer group of the executors on the execution, result and kill queues.
pub const EXECUTOR_GROUP: &str = "executor";

/// Drives executions from the events of the queues.
///
/// # Usage
///
/// ```ignore
/// let executor = Arc::new(Executor::new(flows, store, dedup, registry, queues));
///
/// let cancel = CancellationToken::new();
/// executor.run(cancel).await;
/// ```
pub struct Executor {
  flows: Arc<dyn FlowRepository>,
  store: Arc<dyn ExecutionStore>,
  dedup: Arc<dyn Deduplicator>,
  registry: Arc<Registry>,
  queues: Queues,
  renderer: Arc<dyn Renderer>,
  notifier: Arc<dyn ExecutionNotifier>,
  locks: KeyedLock,
  config: ExecutorConfig,
}

impl Executor {
  pub fn new(
    flows: Arc<dyn FlowRepository>,
    store: Arc<dyn ExecutionStore>,
    dedup: Arc<dyn Deduplicator>,
    registry: Arc<Registry>,
    queues: Queues,
  ) -> Self {
    Self {
      flows,
      store,
      dedup,
      registry,
      queues,
      renderer: Arc::new(MiniJinjaRenderer::new()),
      notifier: Arc::new(NoopNotifier),
      locks: KeyedLock::new(),
      config: ExecutorConfig::default(),
    }
  }

  pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
    self.renderer = renderer;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_config(mut self, config: ExecutorConfig) -> Self {
    self.config = config;
    self
  }

  /// Consume the queues and watch worker liveness until cancelled.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    info!("executor_started");
    self.recover().await;

    let subscriptions = vec![
      self.subscribe_executions(),
      self.subscribe_results(),
      self.subscribe_kills(),
    ];
    let liveness = tokio::spawn(self.registry.clone().run_liveness(cancel.child_token()));
    let trimming = self
      .config
      .trim_interval()
      .map(|period| tokio::spawn(self.clone().run_trim(period, cancel.child_token())));

    cancel.cancelled().await;

    for subscription in subscriptions {
      subscription.shutdown().await;
    }
    let _ = liveness.await;
    if let Some(trimming) = trimming {
      let _ = trimming.await;
    }

    info!("executor_stopped");
  }

  /// Process every unfinished execution once, for changes stored by a
  /// previous executor that stopped before dispatching them.
  async fn recover(&self) {
    let executions = match self.store.list_running().await {
      Ok(executions) => executions,
      Err(e) => {
        error!(error = %e, "execution_recovery_failed");
        return;
      }
    };

    if !executions.is_empty() {
      info!(count = executions.len(), "recovering_executions");
    }
    for execution in executions {
      let execution_id = execution.id.clone();
      if let Err(e) = self.handle_execution(execution).await {
        error!(execution_id = %execution_id, error = %e, "execution_handling_failed");
      }
    }
  }

  /// Remove the executions and results every executor is done with. The
  /// other queues have readers outside the executor group and are kept.
  pub async fn trim_queues(&self) -> Result<u64, ExecutorError> {
    let executions = self.queues.execution.trim(EXECUTOR_GROUP).await?;
    let results = self.queues.worker_task_result.trim(EXECUTOR_GROUP).await?;
    Ok(executions + results)
  }

  async fn run_trim(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = interval.tick() => match self.trim_queues().await {
          Ok(0) => {}
          Ok(trimmed) => debug!(trimmed, "queues_trimmed"),
          Err(e) => error!(error = %e, "queue_trim_failed"),
        },
      }
    }
  }

  fn subscribe_executions(self: &Arc<Self>) -> Subscription {
    let executor = self.clone();
    self
      .queues
      .execution
      .receive(EXECUTOR_GROUP, move |message: Result<Execution, MalformedMessage>| {
        let executor = executor.clone();
        async move {
          let Ok(execution) = message else {
            return;
          };
          let execution_id = execution.id.clone();
          if let Err(e) = executor.handle_execution(execution).await {
            error!(execution_id = %execution_id, error = %e, "execution_handling_failed");
          }
        }
      })
  }

  fn subscribe_results(self: &Arc<Self>) -> Subscription {
    let executor = self.clone();
    self.queues.worker_task_result.receive(
      EXECUTOR_GROUP,
      move |message: Result<WorkerTaskResult, MalformedMessage>| {
        let executor = executor.clone();
        async move {
          let Ok(result) = message else {
            return;
          };
          let execution_id = result.task_run.execution_id.clone();
          if let Err(e) = executor.handle_result(result).await {
            error!(execution_id = %execution_id, error = %e, "result_handling_failed");
          }
        }
      },
    )
  }

  fn subscribe_kills(self: &Arc<Self>) -> Subscription {
    let executor = self.clone();
    self.queues.execution_killed.receive(
      EXECUTOR_GROUP,
      move |message: Result<ExecutionKilled, MalformedMessage>| {
        let executor = executor.clone();
        async move {
          let Ok(killed) = message else {
            return;
          };
          let execution_id = killed.execution_id.clone();
          if let Err(e) = executor.handle_kill(killed).await {
            error!(execution_id = %execution_id, error = %e, "kill_handling_failed");
          }
        }
      },
    )
  }

  /// A submitted (or restarted) execution.
  ///
  /// A known execution is processed again from its stored snapshot, unless
  /// it is terminated and the event restarts that very snapshot. A restart
  /// built from an older snapshot is dropped.
  #[instrument(name = "handle_execution", skip(self, execution), fields(execution_id = %execution.id))]
  pub async fn handle_execution(&self, execution: Execution) -> Result<(), ExecutorError> {
    self
      .transact(&execution.id, |stored| match stored {
        None => {
          info!(flow_id = %execution.flow_id, "execution_accepted");
          Ok(Some(execution.clone()))
        }
        Some(stored) if stored.state.is_terminated() => {
          if execution.state.current == StateType::Restarted
            && execution.state.follows(&stored.state)
          {
            info!("execution_restarting");
            Ok(Some(execution.clone()))
          } else {
            debug!(state = %stored.state.current, "execution_already_terminated");
            Ok(None)
          }
        }
        Some(stored) => Ok(Some(stored.clone())),
      })
      .await
  }

  /// Progress of a task run, reported by a worker.
  #[instrument(
    name = "handle_result",
    skip(self, result),
    fields(execution_id = %result.task_run.execution_id, task_run_id = %result.task_run.id)
  )]
  pub async fn handle_result(&self, result: WorkerTaskResult) -> Result<(), ExecutorError> {
    let WorkerTaskResult {
      task_run,
      worker_uuid,
    } = result;

    self
      .transact(&task_run.execution_id, |stored| {
        let Some(execution) = stored else {
          return Err(
            ModelError::InvariantViolation {
              execution_id: task_run.execution_id.clone(),
              message: format!("result for task run '{}' of an unknown execution", task_run.id),
            }
            .into(),
          );
        };

        if !execution.has_task_run_joinable(&task_run) {
          debug!(
            task = %task_run.describe(),
            state = %task_run.state.current,
            "result_ignored"
          );
          return Ok(None);
        }

        let mut execution = execution.with_task_run(task_run.clone())?;
        if task_run.state.current == StateType::Killed {
          execution = execution.kill_parent_task_runs(&task_run)?;
        }
        Ok(Some(execution))
      })
      .await?;

    if task_run.state.is_terminated() || task_run.state.is_retrying() {
      if let Some(worker_uuid) = worker_uuid {
        self.registry.delete_lease(&task_run.id, worker_uuid).await?;
      }
    }

    Ok(())
  }

  /// A kill request: the execution moves to KILLING and the workers are told
  /// to stop its tasks.
  #[instrument(name = "handle_kill", skip(self, killed), fields(execution_id = %killed.execution_id))]
  pub async fn handle_kill(&self, killed: ExecutionKilled) -> Result<(), ExecutorError> {
    if killed.state != KillState::Requested {
      return Ok(());
    }

    self
      .transact(&killed.execution_id, |stored| {
        let Some(execution) = stored else {
          warn!("kill_of_unknown_execution");
          return Ok(None);
        };
        if execution.state.is_terminated() || execution.state.current == StateType::Killing {
          debug!(state = %execution.state.current, "kill_ignored");
          return Ok(None);
        }

        info!("execution_killing");
        Ok(Some(execution.with_state(StateType::Killing)))
      })
      .await
  }

  /// Apply `update` to the stored execution, process and store the result,
  /// replaying on concurrent writes.
  ///
  /// `update` returns none when the event changes nothing. When it fails, or
  /// processing fails, the execution is stored FAILED and the error returned.
  async fn transact<F>(&self, execution_id: &str, update: F) -> Result<(), ExecutorError>
  where
    F: Fn(Option<&Execution>) -> Result<Option<Execution>, ExecutorError>,
  {
    let _guard = self.locks.lock(execution_id).await;

    for attempt in 0..=self.config.conflict_retries {
      let stored = self.store.find(execution_id).await?;
      let previous = stored.as_ref().map(|v| &v.execution);
      let version = stored.as_ref().map(|v| v.version);

      let mut failure = None;
      let processed = match update(previous) {
        Ok(None) => return Ok(()),
        Ok(Some(updated)) => match self.process(&updated).await {
          Ok(processed) => processed,
          Err(e) => {
            failure = Some(e);
            Processed::failed(&updated)
          }
        },
        Err(e) => match previous {
          Some(previous) if !previous.state.is_terminated() => {
            failure = Some(e);
            Processed::failed(previous)
          }
          _ => return Err(e),
        },
      };

      match self.store.save(&processed.execution, version).await {
        Ok(_) => {
          self.dispatch(previous, processed).await?;
          return failure.map_or(Ok(()), Err);
        }
        Err(StoreError::Conflict { .. }) => {
          warn!(execution_id = %execution_id, attempt, "execution_update_conflict");
        }
        Err(e) => return Err(e.into()),
      }
    }

    Err(ExecutorError::ConflictRetriesExhausted(
      execution_id.to_string(),
    ))
  }

  async fn process(&self, execution: &Execution) -> Result<Processed, ExecutorError> {
    let flow = self
      .flows
      .find_flow(
        &execution.namespace,
        &execution.flow_id,
        execution.flow_revision,
      )
      .await
      .ok_or_else(|| ExecutorError::FlowNotFound {
        namespace: execution.namespace.clone(),
        flow_id: execution.flow_id.clone(),
        revision: execution.flow_revision,
      })?;

    process(
      &flow,
      execution.clone(),
      self.renderer.as_ref(),
      self.config.max_process_iterations,
    )
  }

  /// Side effects of a stored change: kill broadcast, work items,
  /// notifications, and cleanup once the execution is over.
  async fn dispatch(
    &self,
    previous: Option<&Execution>,
    processed: Processed,
  ) -> Result<(), ExecutorError> {
    let execution = &processed.execution;
    let killed = |e: &Execution| {
      matches!(
        e.state.current,
        StateType::Killing | StateType::Killed
      )
    };

    if killed(execution) && !previous.is_some_and(killed) {
      self
        .queues
        .execution_killed
        .emit(&ExecutionKilled::executed(&execution.id))
        .await?;
    }

    for worker_task in &processed.worker_tasks {
      let task_run = &worker_task.task_run;
      let key = work_key(task_run);
      if !self
        .dedup
        .deduplicate(&execution.id, &key, task_run.state.current.as_str())
        .await?
      {
        trace!(key = %key, "worker_task_deduplicated");
        continue;
      }

      self.queues.worker_task.emit(worker_task).await?;
      debug!(
        execution_id = %execution.id,
        task_run_id = %task_run.id,
        task = %task_run.describe(),
        consumer_group = %worker_task.consumer_group(),
        "worker_task_emitted"
      );
    }

    for event in diff(previous, execution) {
      if let ExecutionEvent::TaskRunCreated { task_run_id, .. } = &event {
        let created = execution.task_run_list.iter().find(|t| &t.id == task_run_id);
        if let Some(task_run) = created {
          let key = nexts_key(task_run);
          if !self
            .dedup
            .deduplicate(&execution.id, &key, StateType::Created.as_str())
            .await?
          {
            trace!(key = %key, "task_run_creation_deduplicated");
            continue;
          }
        }
      }
      self.notifier.notify(event);
    }

    if execution.state.is_terminated() {
      self.dedup.purge(&execution.id).await?;
      self.locks.forget(&execution.id).await;
      info!(
        execution_id = %execution.id,
        state = %execution.state.current,
        "execution_terminated"
      );
    }

    Ok(())
  }
}
