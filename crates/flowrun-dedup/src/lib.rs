//! Flowrun Dedup
//!
//! A keyed last-value store used by the executor to drop transitions it
//! already forwarded. Replaying an event (a redelivered queue message, a
//! retried update) recomputes the same new task runs and work items: their
//! key and value match what is stored, and they are dropped.

mod memory;
mod sqlite;

pub use memory::MemoryDeduplicator;
pub use sqlite::SqliteDeduplicator;

use async_trait::async_trait;
use flowrun_model::TaskRun;

/// Error type for deduplication storage.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait Deduplicator: Send + Sync {
  /// Store `value` under `key` for the execution.
  ///
  /// Returns false when the same value was already stored (the caller drops
  /// the item), true otherwise.
  async fn deduplicate(
    &self,
    execution_id: &str,
    key: &str,
    value: &str,
  ) -> Result<bool, DedupError>;

  /// Forget every key of a finished execution.
  async fn purge(&self, execution_id: &str) -> Result<(), DedupError>;
}

/// Key of a task run created by the resolver.
pub fn nexts_key(task_run: &TaskRun) -> String {
  format!(
    "{}-{}-{}-{}-{}",
    task_run.parent_task_run_id.as_deref().unwrap_or("null"),
    task_run.task_id,
    task_run.value.as_deref().unwrap_or("null"),
    task_run.attempt_count(),
    task_run.iteration,
  )
}

/// Key of a work item dispatched for a task run.
pub fn work_key(task_run: &TaskRun) -> String {
  format!(
    "{}-{}-{}",
    task_run.id,
    task_run.attempt_count(),
    task_run.iteration
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowrun_config::{Flow, Task};
  use flowrun_model::{Execution, ResolvedTask};

  #[test]
  fn test_keys() {
    let flow = Flow::new("io.flowrun", "dedup", vec![Task::runnable("a", "log")]);
    let execution = Execution::new(&flow, Default::default());
    let mut resolved = ResolvedTask::of(&flow.tasks).remove(0);
    resolved.value = Some("x".to_string());
    resolved.parent_id = Some("p".to_string());
    let task_run = TaskRun::of(&execution, &resolved);

    assert_eq!(nexts_key(&task_run), "p-a-x-0-0");
    assert_eq!(work_key(&task_run), format!("{}-0-0", task_run.id));
  }
}
