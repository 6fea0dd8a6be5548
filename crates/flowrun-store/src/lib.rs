//! Flowrun Store
//!
//! Persistence of executions and the shared SQLite plumbing.
//!
//! The [`ExecutionStore`] keeps the current snapshot of every execution
//! together with a version number. Writers pass the version they read:
//! a concurrent update in between makes the save fail with
//! [`StoreError::Conflict`] and the caller retries on the fresh snapshot.
//!
//! Every SQLite backed component of flowrun (queues, dedup keys, worker
//! registry, executions) shares one database and one set of migrations,
//! applied by [`migrate`].

mod error;
mod memory;
mod sqlite;

pub use error::StoreError;
pub use memory::MemoryExecutionStore;
pub use sqlite::{SqliteExecutionStore, connect, migrate};

use async_trait::async_trait;
use flowrun_model::Execution;

/// An execution as stored, with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
  pub execution: Execution,
  pub version: i64,
}

/// Storage of execution snapshots with optimistic concurrency.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
  /// Get an execution by ID.
  async fn find(&self, execution_id: &str) -> Result<Option<Versioned>, StoreError>;

  /// Like [`ExecutionStore::find`], failing when the execution is missing.
  async fn get(&self, execution_id: &str) -> Result<Versioned, StoreError> {
    self
      .find(execution_id)
      .await?
      .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
  }

  /// Store `execution` if its stored version is still `expected_version`
  /// (none for a new execution), returning the new version.
  async fn save(
    &self,
    execution: &Execution,
    expected_version: Option<i64>,
  ) -> Result<i64, StoreError>;

  /// Executions that are not terminated yet.
  async fn list_running(&self) -> Result<Vec<Execution>, StoreError>;
}
