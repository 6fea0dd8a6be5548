use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use flowrun_config::Task;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task_run::TaskRun;

/// A task run dispatched to the workers, with everything needed to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
  pub task_run: TaskRun,
  pub task: Task,
  /// Variables the task properties are rendered against.
  #[serde(default)]
  pub variables: serde_json::Value,
}

impl WorkerTask {
  pub fn with_task_run(&self, task_run: TaskRun) -> Self {
    Self {
      task_run,
      ..self.clone()
    }
  }

  /// Consumer group of the workers allowed to run this task.
  pub fn consumer_group(&self) -> String {
    worker_consumer_group(self.task.worker_group.as_deref())
  }
}

/// Consumer group of the workers of `worker_group`.
pub fn worker_consumer_group(worker_group: Option<&str>) -> String {
  match worker_group {
    Some(group) => format!("worker:{}", group),
    None => "worker".to_string(),
  }
}

/// Progress of a task run as reported by a worker (or by the executor for
/// flowable tasks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTaskResult {
  pub task_run: TaskRun,
  /// The worker holding the lease of the task run, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_uuid: Option<Uuid>,
}

impl WorkerTaskResult {
  pub fn new(task_run: TaskRun) -> Self {
    Self {
      task_run,
      worker_uuid: None,
    }
  }

  pub fn with_worker(mut self, worker_uuid: Uuid) -> Self {
    self.worker_uuid = Some(worker_uuid);
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillState {
  /// Asked by a user, to be handled by the executor.
  Requested,
  /// Handled by the executor, workers must stop the execution's tasks.
  Executed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionKilled {
  pub execution_id: String,
  pub state: KillState,
}

impl ExecutionKilled {
  pub fn requested(execution_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      state: KillState::Requested,
    }
  }

  pub fn executed(execution_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      state: KillState::Executed,
    }
  }
}

/// A live worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInstance {
  pub worker_uuid: Uuid,
  pub hostname: String,
  pub worker_group: Option<String>,
  pub partitions: BTreeSet<i32>,
  pub started_at: DateTime<Utc>,
  pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInstance {
  pub fn new(hostname: impl Into<String>, worker_group: Option<String>) -> Self {
    let now = Utc::now();
    Self {
      worker_uuid: Uuid::new_v4(),
      hostname: hostname.into(),
      worker_group,
      partitions: BTreeSet::new(),
      started_at: now,
      last_heartbeat: now,
    }
  }
}

/// Lease of a worker on a dispatched task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJobRunning {
  pub task_run_id: String,
  pub worker_uuid: Uuid,
  pub lease_timestamp: DateTime<Utc>,
  pub worker_task: WorkerTask,
}

impl WorkerJobRunning {
  pub fn of(worker_task: &WorkerTask, worker_uuid: Uuid) -> Self {
    Self {
      task_run_id: worker_task.task_run.id.clone(),
      worker_uuid,
      lease_timestamp: Utc::now(),
      worker_task: worker_task.clone(),
    }
  }
}
