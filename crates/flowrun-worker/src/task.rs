//! Task logic invoked by the worker.

use std::time::Duration;

use async_trait::async_trait;
use flowrun_config::Task;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;

/// What a task run is, for the task logic.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub execution_id: String,
  pub task_run_id: String,
  pub task_id: String,
  /// Value of the task run inside an each loop.
  pub value: Option<String>,
  /// Number of the attempt, starting at 1.
  pub attempt: u32,
}

/// Runs the logic of runnable tasks.
///
/// `properties` are the task properties, already rendered. Implementations
/// should return early once `cancel` fires, the worker stops waiting for
/// them anyway.
#[async_trait]
pub trait TaskRunner: Send + Sync {
  async fn run(
    &self,
    task: &Task,
    properties: Map<String, Value>,
    context: &TaskContext,
    cancel: CancellationToken,
  ) -> Result<Map<String, Value>, TaskError>;
}

/// Task logic shipped with flowrun, picked by the `runner` of the task:
///
/// - `return`: outputs `{ "value": <format> }`
/// - `log`: logs `message`
/// - `fail`: fails with `message`
/// - `sleep`: waits `duration_ms`
#[derive(Debug, Clone, Default)]
pub struct BuiltinTaskRunner;

impl BuiltinTaskRunner {
  pub fn new() -> Self {
    Self
  }
}

#[async_trait]
impl TaskRunner for BuiltinTaskRunner {
  async fn run(
    &self,
    task: &Task,
    properties: Map<String, Value>,
    context: &TaskContext,
    cancel: CancellationToken,
  ) -> Result<Map<String, Value>, TaskError> {
    let runner = runner_name(task)?;
    let mut outputs = Map::new();

    match runner {
      "return" => {
        let value = properties.get("format").cloned().unwrap_or(Value::Null);
        outputs.insert("value".to_string(), value);
      }
      "log" => {
        let message = string_property(&properties, "message").unwrap_or_default();
        match properties.get("level").and_then(Value::as_str) {
          Some("warn") => warn!(task_run_id = %context.task_run_id, "{}", message),
          Some("debug") => debug!(task_run_id = %context.task_run_id, "{}", message),
          _ => info!(task_run_id = %context.task_run_id, "{}", message),
        }
      }
      "fail" => {
        let message =
          string_property(&properties, "message").unwrap_or_else(|| "task failed".to_string());
        return Err(TaskError::Failed(message));
      }
      "sleep" => {
        let duration = properties
          .get("duration_ms")
          .map(|value| {
            value
              .as_u64()
              .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
              .ok_or_else(|| TaskError::InvalidProperty {
                name: "duration_ms".to_string(),
                message: format!("expected milliseconds, got {}", value),
              })
          })
          .transpose()?
          .unwrap_or(0);

        tokio::select! {
          _ = cancel.cancelled() => {}
          _ = tokio::time::sleep(Duration::from_millis(duration)) => {}
        }
      }
      other => return Err(TaskError::UnknownRunner(other.to_string())),
    }

    Ok(outputs)
  }
}

fn runner_name(task: &Task) -> Result<&str, TaskError> {
  match &task.kind {
    flowrun_config::TaskKind::Runnable(runnable) => Ok(runnable.runner.as_str()),
    _ => Err(TaskError::NotRunnable(task.id.clone())),
  }
}

fn string_property(properties: &Map<String, Value>, name: &str) -> Option<String> {
  properties.get(name).map(|value| match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  })
}
