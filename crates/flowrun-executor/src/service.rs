use std::collections::HashSet;
use std::sync::Arc;

use flowrun_config::Flow;
use flowrun_model::{Execution, ExecutionKilled, StateType};
use flowrun_queue::Queues;
use flowrun_resolver::{flowable, validate_flow};
use flowrun_store::ExecutionStore;
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::error::ExecutorError;
use crate::flows::FlowRepository;

/// Operations offered to users: publish flows, submit, kill and restart
/// executions. Everything goes through the queues, the executor does the
/// actual work.
pub struct ExecutionService {
  store: Arc<dyn ExecutionStore>,
  flows: Arc<dyn FlowRepository>,
  queues: Queues,
}

impl ExecutionService {
  pub fn new(store: Arc<dyn ExecutionStore>, flows: Arc<dyn FlowRepository>, queues: Queues) -> Self {
    Self {
      store,
      flows,
      queues,
    }
  }

  /// Make a flow revision available to the executors.
  #[instrument(name = "publish_flow", skip(self, flow), fields(flow = %flow.uid()))]
  pub async fn publish_flow(&self, flow: &Flow) -> Result<(), ExecutorError> {
    validate_flow(flow)?;
    self.queues.flow.emit(flow).await?;
    info!("flow_published");
    Ok(())
  }

  /// Start a new execution of `flow`.
  #[instrument(name = "submit_execution", skip(self, flow, inputs), fields(flow = %flow.uid()))]
  pub async fn submit(
    &self,
    flow: &Flow,
    inputs: Map<String, Value>,
  ) -> Result<Execution, ExecutorError> {
    let execution = Execution::new(flow, inputs);
    self.queues.execution.emit(&execution).await?;
    info!(execution_id = %execution.id, "execution_submitted");
    Ok(execution)
  }

  /// Ask the executor to kill an execution.
  pub async fn kill(&self, execution_id: &str) -> Result<(), ExecutorError> {
    self
      .queues
      .execution_killed
      .emit(&ExecutionKilled::requested(execution_id))
      .await?;
    info!(execution_id = %execution_id, "kill_requested");
    Ok(())
  }

  /// Run the failed and killed parts of a terminated execution again.
  #[instrument(name = "restart_execution", skip(self))]
  pub async fn restart(&self, execution_id: &str) -> Result<Execution, ExecutorError> {
    let stored = self.store.get(execution_id).await?.execution;
    let flow = self
      .flows
      .find_flow(&stored.namespace, &stored.flow_id, stored.flow_revision)
      .await
      .ok_or_else(|| ExecutorError::FlowNotFound {
        namespace: stored.namespace.clone(),
        flow_id: stored.flow_id.clone(),
        revision: stored.flow_revision,
      })?;

    let restarted = restart(&flow, &stored)?;
    self.queues.execution.emit(&restarted).await?;
    info!("execution_restart_submitted");
    Ok(restarted)
  }

  pub async fn find(&self, execution_id: &str) -> Result<Option<Execution>, ExecutorError> {
    Ok(self.store.find(execution_id).await?.map(|v| v.execution))
  }
}

/// The RESTARTED copy of a terminated `execution`.
///
/// Failed and killed task runs move to RESTARTED together with their
/// ancestors. Task runs of error branches, and everything below them, are
/// dropped so the branches run again if needed.
pub fn restart(flow: &Flow, execution: &Execution) -> Result<Execution, ExecutorError> {
  let not_restartable = || ExecutorError::NotRestartable {
    execution_id: execution.id.clone(),
    state: execution.state.current.to_string(),
  };
  if !execution.state.is_terminated() {
    return Err(not_restartable());
  }

  let mut error_tasks: HashSet<&str> = flow.errors.iter().map(|t| t.id.as_str()).collect();
  for task in flow.all_tasks() {
    if let Some(flowable) = flowable(task) {
      error_tasks.extend(flowable.errors().iter().map(|t| t.id.as_str()));
    }
  }

  let dropped: HashSet<&str> = execution
    .task_run_list
    .iter()
    .filter(|task_run| {
      error_tasks.contains(task_run.task_id.as_str())
        || execution
          .find_parents(task_run)
          .iter()
          .any(|parent| error_tasks.contains(parent.task_id.as_str()))
    })
    .map(|task_run| task_run.id.as_str())
    .collect();

  let mut restarted: HashSet<&str> = HashSet::new();
  for task_run in &execution.task_run_list {
    if dropped.contains(task_run.id.as_str()) {
      continue;
    }
    if matches!(
      task_run.state.current,
      StateType::Failed | StateType::Killed
    ) {
      restarted.insert(task_run.id.as_str());
      restarted.extend(execution.find_parents(task_run).iter().map(|p| p.id.as_str()));
    }
  }
  if restarted.is_empty() {
    return Err(not_restartable());
  }

  let task_run_list = execution
    .task_run_list
    .iter()
    .filter(|task_run| !dropped.contains(task_run.id.as_str()))
    .map(|task_run| {
      if restarted.contains(task_run.id.as_str()) {
        task_run.restart()
      } else {
        task_run.clone()
      }
    })
    .collect();

  Ok(execution.with_restart(task_run_list))
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowrun_config::{Parallel, Task, TaskKind};
  use flowrun_model::{ResolvedTask, TaskRun};

  fn flow() -> Flow {
    Flow::new(
      "io.flowrun",
      "restart",
      vec![
        Task::new(
          "group",
          TaskKind::Parallel(Parallel {
            tasks: vec![Task::runnable("a", "fail"), Task::runnable("b", "log")],
            errors: vec![Task::runnable("e", "log")],
            concurrency: 0,
          }),
        ),
        Task::runnable("after", "log"),
      ],
    )
  }

  fn done(execution: &Execution, resolved: &ResolvedTask, state: StateType) -> TaskRun {
    TaskRun::of(execution, resolved)
      .with_state(StateType::Running)
      .with_state(state)
  }

  fn failed_execution(flow: &Flow) -> Execution {
    let execution = Execution::new(flow, Map::new());
    let group = done(&execution, &ResolvedTask::of(&flow.tasks)[0], StateType::Failed);
    let Some(TaskKind::Parallel(parallel)) = flow.find_task("group").map(|t| &t.kind) else {
      unreachable!()
    };
    let children = ResolvedTask::children(&parallel.tasks, &group);
    let errors = ResolvedTask::children(&parallel.errors, &group);

    execution
      .with_task_run_list(vec![
        group.clone(),
        done(&execution, &children[0], StateType::Failed),
        done(&execution, &children[1], StateType::Success),
        done(&execution, &errors[0], StateType::Success),
      ])
      .with_state(StateType::Running)
      .with_state(StateType::Failed)
  }

  #[test]
  fn test_restart_failed_branch() {
    let flow = flow();
    let execution = failed_execution(&flow);

    let restarted = restart(&flow, &execution).unwrap();

    assert_eq!(restarted.state.current, StateType::Restarted);
    let states: Vec<(&str, StateType)> = restarted
      .task_run_list
      .iter()
      .map(|t| (t.task_id.as_str(), t.state.current))
      .collect();
    assert_eq!(
      states,
      vec![
        ("group", StateType::Restarted),
        ("a", StateType::Restarted),
        ("b", StateType::Success),
      ]
    );
    // the ids are kept, results of the restarted runs can still be merged
    assert_eq!(restarted.task_run_list[0].id, execution.task_run_list[0].id);
  }

  #[test]
  fn test_running_execution_is_not_restartable() {
    let flow = flow();
    let execution = Execution::new(&flow, Map::new()).with_state(StateType::Running);

    assert!(matches!(
      restart(&flow, &execution),
      Err(ExecutorError::NotRestartable { .. })
    ));
  }

  #[test]
  fn test_successful_execution_has_nothing_to_restart() {
    let flow = Flow::new("io.flowrun", "ok", vec![Task::runnable("a", "log")]);
    let execution = Execution::new(&flow, Map::new());
    let a = done(&execution, &ResolvedTask::of(&flow.tasks)[0], StateType::Success);
    let execution = execution
      .with_task_run_list(vec![a])
      .with_state(StateType::Running)
      .with_state(StateType::Success);

    assert!(restart(&flow, &execution).is_err());
  }
}
