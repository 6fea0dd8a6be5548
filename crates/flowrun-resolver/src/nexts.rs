use flowrun_config::DagTask;
use flowrun_model::{Execution, ResolvedTask, StateType, TaskRun};

/// Next task run of a scope whose tasks run one after the other.
///
/// Nothing is returned while a task run of the scope is still pending: the
/// task following the last terminated one only starts once it is over.
pub fn resolve_sequential_nexts(
  execution: &Execution,
  tasks: &[ResolvedTask],
  errors: &[ResolvedTask],
) -> Vec<TaskRun> {
  let current = execution.find_task_depending_flow_state(tasks, errors);
  let Some(first) = current.first() else {
    return Vec::new();
  };

  let task_runs = execution.find_task_run_by_tasks(&current);
  if task_runs.is_empty() {
    return vec![TaskRun::of(execution, first)];
  }

  if task_runs.iter().any(|t| !t.state.is_terminated()) {
    return Vec::new();
  }

  let Some(last) = execution.find_last_terminated(&current) else {
    return Vec::new();
  };

  current
    .iter()
    .position(|resolved| resolved.is_task_run_for(last))
    .and_then(|index| current.get(index + 1))
    .filter(|next| !task_runs.iter().any(|t| next.is_task_run_for(t)))
    .map(|next| vec![TaskRun::of(execution, next)])
    .unwrap_or_default()
}

/// Task runs to start in a scope whose tasks all run at once.
///
/// With a `concurrency` above zero, no more than that many task runs of the
/// scope are left unfinished.
pub fn resolve_parallel_nexts(
  execution: &Execution,
  tasks: &[ResolvedTask],
  errors: &[ResolvedTask],
  concurrency: u32,
) -> Vec<TaskRun> {
  let current = execution.find_task_depending_flow_state(tasks, errors);
  start_not_started(execution, &current, concurrency, |_| true)
}

/// Task runs to start in a dag scope: a task is ready once every task it
/// depends on ended successfully.
///
/// Error tasks are not part of `dag` and have no dependency.
pub fn resolve_dag_nexts(
  execution: &Execution,
  tasks: &[ResolvedTask],
  errors: &[ResolvedTask],
  dag: &[DagTask],
  concurrency: u32,
) -> Vec<TaskRun> {
  let current = execution.find_task_depending_flow_state(tasks, errors);

  start_not_started(execution, &current, concurrency, |resolved| {
    let Some(dag_task) = dag.iter().find(|d| d.task.id == resolved.task.id) else {
      return true;
    };

    dag_task.depends_on.iter().all(|dependency| {
      let upstream: Vec<ResolvedTask> = tasks
        .iter()
        .filter(|t| &t.task.id == dependency)
        .cloned()
        .collect();

      // a disabled dependency never runs, it doesn't hold the others back
      if upstream.iter().all(|t| t.task.disabled) {
        return true;
      }

      execution
        .find_task_run_by_tasks(&upstream)
        .iter()
        .any(|t| t.state.current.is_successful())
    })
  })
}

fn start_not_started(
  execution: &Execution,
  current: &[ResolvedTask],
  concurrency: u32,
  ready: impl Fn(&ResolvedTask) -> bool,
) -> Vec<TaskRun> {
  if current.is_empty() {
    return Vec::new();
  }

  let task_runs = execution.find_task_run_by_tasks(current);
  if task_runs.iter().any(|t| t.state.is_created()) {
    return Vec::new();
  }

  let mut nexts: Vec<TaskRun> = current
    .iter()
    .filter(|resolved| !task_runs.iter().any(|t| resolved.is_task_run_for(t)))
    .filter(|resolved| ready(resolved))
    .map(|resolved| TaskRun::of(execution, resolved))
    .collect();

  if concurrency > 0 {
    let pending = task_runs
      .iter()
      .filter(|t| !t.state.is_terminated())
      .count();
    let available = (concurrency as usize).saturating_sub(pending);
    nexts.truncate(available);
  }

  nexts
}

/// Final state of a scope, once it is over.
///
/// A scope is over when every task of the selected branch has a terminated
/// task run, or when a task failed and there is no error branch to run. It is
/// never over while a task run of the scope is still unfinished: a failure
/// doesn't abort the siblings that already started.
///
/// Normal and error task runs both count toward the outcome, so a failure
/// handled by the error branch still ends the scope FAILED (or WARNING with
/// `allow_failure`).
pub fn resolve_scope_state(
  execution: &Execution,
  tasks: &[ResolvedTask],
  errors: &[ResolvedTask],
  allow_failure: bool,
) -> Option<StateType> {
  let all: Vec<ResolvedTask> = tasks.iter().chain(errors).cloned().collect();
  if execution.has_pending(&all) {
    return None;
  }

  let current = execution.find_task_depending_flow_state(tasks, errors);

  if !current.is_empty() {
    if execution.is_terminated(&current) {
      return Some(execution.guess_final_state(&all, allow_failure));
    }
    return None;
  }

  if execution.has_failed(tasks) {
    return Some(execution.guess_final_state(&all, allow_failure));
  }

  // nothing to run at all: an empty branch or only disabled tasks
  if tasks.iter().all(|t| t.task.disabled) {
    return Some(StateType::Success);
  }

  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowrun_config::{Flow, Task};

  fn flow(ids: &[&str]) -> Flow {
    Flow::new(
      "io.flowrun",
      "nexts",
      ids.iter().map(|id| Task::runnable(*id, "log")).collect(),
    )
  }

  fn append(execution: &Execution, task_runs: Vec<TaskRun>) -> Execution {
    let mut list = execution.task_run_list.clone();
    list.extend(task_runs);
    execution.with_task_run_list(list)
  }

  fn set_state(execution: &Execution, task_id: &str, state: StateType) -> Execution {
    let task_run = execution
      .task_run_list
      .iter()
      .find(|t| t.task_id == task_id)
      .unwrap()
      .clone();
    let task_run = if state.is_terminated() && !task_run.state.is_running() {
      task_run.with_state(StateType::Running).with_state(state)
    } else {
      task_run.with_state(state)
    };
    execution.with_task_run(task_run).unwrap()
  }

  fn ids(task_runs: &[TaskRun]) -> Vec<&str> {
    task_runs.iter().map(|t| t.task_id.as_str()).collect()
  }

  #[test]
  fn test_sequential_in_order() {
    let flow = flow(&["a", "b", "c"]);
    let tasks = ResolvedTask::of(&flow.tasks);
    let mut execution = Execution::new(&flow, Default::default());

    let nexts = resolve_sequential_nexts(&execution, &tasks, &[]);
    assert_eq!(ids(&nexts), vec!["a"]);
    execution = append(&execution, nexts);

    // a still created, nothing new
    assert!(resolve_sequential_nexts(&execution, &tasks, &[]).is_empty());

    execution = set_state(&execution, "a", StateType::Running);
    assert!(resolve_sequential_nexts(&execution, &tasks, &[]).is_empty());

    execution = set_state(&execution, "a", StateType::Success);
    let nexts = resolve_sequential_nexts(&execution, &tasks, &[]);
    assert_eq!(ids(&nexts), vec!["b"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "b", StateType::Success);

    let nexts = resolve_sequential_nexts(&execution, &tasks, &[]);
    assert_eq!(ids(&nexts), vec!["c"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "c", StateType::Success);

    assert!(resolve_sequential_nexts(&execution, &tasks, &[]).is_empty());
    assert_eq!(
      resolve_scope_state(&execution, &tasks, &[], false),
      Some(StateType::Success)
    );
  }

  #[test]
  fn test_sequential_switches_to_errors() {
    let flow = flow(&["a", "b"]).with_errors(vec![Task::runnable("e", "log")]);
    let tasks = ResolvedTask::of(&flow.tasks);
    let errors = ResolvedTask::of(&flow.errors);
    let mut execution = Execution::new(&flow, Default::default());

    execution = append(&execution, resolve_sequential_nexts(&execution, &tasks, &errors));
    execution = set_state(&execution, "a", StateType::Failed);

    // b is never started
    let nexts = resolve_sequential_nexts(&execution, &tasks, &errors);
    assert_eq!(ids(&nexts), vec!["e"]);
    execution = append(&execution, nexts);
    assert_eq!(resolve_scope_state(&execution, &tasks, &errors, false), None);

    execution = set_state(&execution, "e", StateType::Success);
    assert!(resolve_sequential_nexts(&execution, &tasks, &errors).is_empty());
    assert_eq!(
      resolve_scope_state(&execution, &tasks, &errors, false),
      Some(StateType::Failed)
    );
    assert_eq!(
      resolve_scope_state(&execution, &tasks, &errors, true),
      Some(StateType::Warning)
    );
  }

  #[test]
  fn test_failure_without_errors_ends_scope() {
    let flow = flow(&["a", "b"]);
    let tasks = ResolvedTask::of(&flow.tasks);
    let mut execution = Execution::new(&flow, Default::default());

    execution = append(&execution, resolve_sequential_nexts(&execution, &tasks, &[]));
    execution = set_state(&execution, "a", StateType::Failed);

    assert!(resolve_sequential_nexts(&execution, &tasks, &[]).is_empty());
    assert_eq!(
      resolve_scope_state(&execution, &tasks, &[], false),
      Some(StateType::Failed)
    );
  }

  #[test]
  fn test_parallel_waits_for_started_siblings() {
    let flow = flow(&["a", "b"]).with_errors(vec![Task::runnable("e", "log")]);
    let tasks = ResolvedTask::of(&flow.tasks);
    let errors = ResolvedTask::of(&flow.errors);
    let mut execution = Execution::new(&flow, Default::default());

    let nexts = resolve_parallel_nexts(&execution, &tasks, &errors, 0);
    assert_eq!(ids(&nexts), vec!["a", "b"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "a", StateType::Running);
    execution = set_state(&execution, "b", StateType::Running);
    execution = set_state(&execution, "a", StateType::Failed);

    let nexts = resolve_parallel_nexts(&execution, &tasks, &errors, 0);
    assert_eq!(ids(&nexts), vec!["e"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "e", StateType::Success);

    // b still running
    assert_eq!(resolve_scope_state(&execution, &tasks, &errors, false), None);

    execution = set_state(&execution, "b", StateType::Success);
    assert_eq!(
      resolve_scope_state(&execution, &tasks, &errors, false),
      Some(StateType::Failed)
    );
  }

  #[test]
  fn test_parallel_concurrency() {
    let flow = flow(&["a", "b", "c"]);
    let tasks = ResolvedTask::of(&flow.tasks);
    let mut execution = Execution::new(&flow, Default::default());

    let nexts = resolve_parallel_nexts(&execution, &tasks, &[], 2);
    assert_eq!(ids(&nexts), vec!["a", "b"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "a", StateType::Running);
    execution = set_state(&execution, "b", StateType::Running);

    assert!(resolve_parallel_nexts(&execution, &tasks, &[], 2).is_empty());

    execution = set_state(&execution, "a", StateType::Success);
    let nexts = resolve_parallel_nexts(&execution, &tasks, &[], 2);
    assert_eq!(ids(&nexts), vec!["c"]);
  }

  #[test]
  fn test_dag_dependencies() {
    let dag = vec![
      DagTask {
        task: Task::runnable("a", "log"),
        depends_on: vec![],
      },
      DagTask {
        task: Task::runnable("b", "log"),
        depends_on: vec!["a".to_string()],
      },
      DagTask {
        task: Task::runnable("c", "log"),
        depends_on: vec![],
      },
      DagTask {
        task: Task::runnable("d", "log"),
        depends_on: vec!["b".to_string(), "c".to_string()],
      },
    ];
    let flow = flow(&["x"]);
    let children: Vec<Task> = dag.iter().map(|d| d.task.clone()).collect();
    let tasks = ResolvedTask::of(&children);
    let mut execution = Execution::new(&flow, Default::default());

    let nexts = resolve_dag_nexts(&execution, &tasks, &[], &dag, 0);
    assert_eq!(ids(&nexts), vec!["a", "c"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "a", StateType::Success);
    execution = set_state(&execution, "c", StateType::Running);

    let nexts = resolve_dag_nexts(&execution, &tasks, &[], &dag, 0);
    assert_eq!(ids(&nexts), vec!["b"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "b", StateType::Warning);

    assert!(resolve_dag_nexts(&execution, &tasks, &[], &dag, 0).is_empty());
    execution = set_state(&execution, "c", StateType::Success);

    let nexts = resolve_dag_nexts(&execution, &tasks, &[], &dag, 0);
    assert_eq!(ids(&nexts), vec!["d"]);
    execution = append(&execution, nexts);
    execution = set_state(&execution, "d", StateType::Success);

    assert_eq!(
      resolve_scope_state(&execution, &tasks, &[], false),
      Some(StateType::Warning)
    );
  }

  #[test]
  fn test_empty_scope_is_successful() {
    let flow = flow(&["x"]);
    let execution = Execution::new(&flow, Default::default());

    assert!(resolve_sequential_nexts(&execution, &[], &[]).is_empty());
    assert_eq!(
      resolve_scope_state(&execution, &[], &[], false),
      Some(StateType::Success)
    );
  }
}
