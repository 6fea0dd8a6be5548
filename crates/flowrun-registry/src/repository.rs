use async_trait::async_trait;
use flowrun_model::{WorkerInstance, WorkerJobRunning};
use uuid::Uuid;

use crate::error::RegistryError;

/// Storage of worker instances and job leases.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
  /// Every instance, in registration order.
  async fn list_instances(&self) -> Result<Vec<WorkerInstance>, RegistryError>;

  async fn find_instance(&self, worker_uuid: Uuid)
  -> Result<Option<WorkerInstance>, RegistryError>;

  /// Insert or replace an instance.
  async fn save_instance(&self, instance: &WorkerInstance) -> Result<(), RegistryError>;

  /// Returns false when there was nothing to delete.
  async fn delete_instance(&self, worker_uuid: Uuid) -> Result<bool, RegistryError>;

  /// Insert or replace the lease of a task run.
  async fn save_lease(&self, lease: &WorkerJobRunning) -> Result<(), RegistryError>;

  /// Delete the lease of a task run, only while `worker_uuid` holds it.
  async fn delete_lease(&self, task_run_id: &str, worker_uuid: Uuid)
  -> Result<(), RegistryError>;

  /// Leases held by an instance.
  async fn leases_of(&self, worker_uuid: Uuid) -> Result<Vec<WorkerJobRunning>, RegistryError>;
}
