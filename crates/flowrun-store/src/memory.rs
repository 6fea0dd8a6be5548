use std::collections::HashMap;

use async_trait::async_trait;
use flowrun_model::Execution;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::{ExecutionStore, Versioned};

/// In-memory [`ExecutionStore`].
#[derive(Default)]
pub struct MemoryExecutionStore {
  executions: RwLock<HashMap<String, Versioned>>,
}

impl MemoryExecutionStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
  async fn find(&self, execution_id: &str) -> Result<Option<Versioned>, StoreError> {
    Ok(self.executions.read().await.get(execution_id).cloned())
  }

  async fn save(
    &self,
    execution: &Execution,
    expected_version: Option<i64>,
  ) -> Result<i64, StoreError> {
    let mut executions = self.executions.write().await;
    let found = executions.get(&execution.id).map(|v| v.version);

    if found != expected_version {
      return Err(StoreError::Conflict {
        execution_id: execution.id.clone(),
        expected: expected_version,
        found,
      });
    }

    let version = found.unwrap_or(0) + 1;
    executions.insert(
      execution.id.clone(),
      Versioned {
        execution: execution.clone(),
        version,
      },
    );

    Ok(version)
  }

  async fn list_running(&self) -> Result<Vec<Execution>, StoreError> {
    Ok(
      self
        .executions
        .read()
        .await
        .values()
        .filter(|v| !v.execution.state.is_terminated())
        .map(|v| v.execution.clone())
        .collect(),
    )
  }
}
