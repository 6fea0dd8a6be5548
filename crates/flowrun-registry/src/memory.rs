use std::collections::HashMap;

use async_trait::async_trait;
use flowrun_model::{WorkerInstance, WorkerJobRunning};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::repository::InstanceRepository;

/// In-memory [`InstanceRepository`].
#[derive(Default)]
pub struct MemoryInstanceRepository {
  instances: RwLock<Vec<WorkerInstance>>,
  leases: RwLock<HashMap<String, WorkerJobRunning>>,
}

impl MemoryInstanceRepository {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceRepository {
  async fn list_instances(&self) -> Result<Vec<WorkerInstance>, RegistryError> {
    Ok(self.instances.read().await.clone())
  }

  async fn find_instance(
    &self,
    worker_uuid: Uuid,
  ) -> Result<Option<WorkerInstance>, RegistryError> {
    Ok(
      self
        .instances
        .read()
        .await
        .iter()
        .find(|i| i.worker_uuid == worker_uuid)
        .cloned(),
    )
  }

  async fn save_instance(&self, instance: &WorkerInstance) -> Result<(), RegistryError> {
    let mut instances = self.instances.write().await;
    match instances
      .iter_mut()
      .find(|i| i.worker_uuid == instance.worker_uuid)
    {
      Some(existing) => *existing = instance.clone(),
      None => instances.push(instance.clone()),
    }
    Ok(())
  }

  async fn delete_instance(&self, worker_uuid: Uuid) -> Result<bool, RegistryError> {
    let mut instances = self.instances.write().await;
    let before = instances.len();
    instances.retain(|i| i.worker_uuid != worker_uuid);
    Ok(instances.len() != before)
  }

  async fn save_lease(&self, lease: &WorkerJobRunning) -> Result<(), RegistryError> {
    self
      .leases
      .write()
      .await
      .insert(lease.task_run_id.clone(), lease.clone());
    Ok(())
  }

  async fn delete_lease(
    &self,
    task_run_id: &str,
    worker_uuid: Uuid,
  ) -> Result<(), RegistryError> {
    let mut leases = self.leases.write().await;
    if leases
      .get(task_run_id)
      .is_some_and(|lease| lease.worker_uuid == worker_uuid)
    {
      leases.remove(task_run_id);
    }
    Ok(())
  }

  async fn leases_of(&self, worker_uuid: Uuid) -> Result<Vec<WorkerJobRunning>, RegistryError> {
    let mut leases: Vec<WorkerJobRunning> = self
      .leases
      .read()
      .await
      .values()
      .filter(|lease| lease.worker_uuid == worker_uuid)
      .cloned()
      .collect();
    leases.sort_by_key(|lease| lease.lease_timestamp);
    Ok(leases)
  }
}
