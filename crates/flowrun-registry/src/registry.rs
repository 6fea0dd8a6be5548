use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowrun_model::{WorkerInstance, WorkerJobRunning, WorkerTask};
use flowrun_queue::Queue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::partitions::{assign_partitions, redistribute_partitions, remove_evicted_partitions};
use crate::repository::InstanceRepository;

/// Registration, heartbeats and eviction of worker instances.
pub struct Registry {
  repository: Arc<dyn InstanceRepository>,
  worker_task_queue: Queue<WorkerTask>,
  config: RegistryConfig,
  /// Serializes read-modify-write cycles on the instances.
  lock: Mutex<()>,
}

impl Registry {
  pub fn new(
    repository: Arc<dyn InstanceRepository>,
    worker_task_queue: Queue<WorkerTask>,
    config: RegistryConfig,
  ) -> Self {
    Self {
      repository,
      worker_task_queue,
      config,
      lock: Mutex::new(()),
    }
  }

  pub fn config(&self) -> &RegistryConfig {
    &self.config
  }

  /// Register a new worker, with its share of the partitions.
  #[instrument(name = "register_worker", skip(self))]
  pub async fn register(
    &self,
    hostname: &str,
    worker_group: Option<String>,
  ) -> Result<WorkerInstance, RegistryError> {
    let _guard = self.lock.lock().await;
    let instance = WorkerInstance::new(hostname, worker_group);
    self.register_locked(instance).await
  }

  /// Refresh the heartbeat of `worker_uuid`.
  ///
  /// An instance that was evicted in the meantime is registered again, under
  /// the same uuid, and receives new partitions.
  #[instrument(name = "heartbeat", skip(self, instance), fields(worker_uuid = %instance.worker_uuid))]
  pub async fn heartbeat(&self, instance: &WorkerInstance) -> Result<WorkerInstance, RegistryError> {
    let _guard = self.lock.lock().await;

    let Some(mut stored) = self.repository.find_instance(instance.worker_uuid).await? else {
      warn!(worker_uuid = %instance.worker_uuid, "worker_record_missing_registering_again");
      let mut fresh = instance.clone();
      fresh.partitions = BTreeSet::new();
      fresh.last_heartbeat = Utc::now();
      return self.register_locked(fresh).await;
    };

    stored.last_heartbeat = Utc::now();
    self.save_and_evict(&stored).await?;
    debug!(partitions = ?stored.partitions, "heartbeat_recorded");

    Ok(stored)
  }

  /// Remove a worker that stops cleanly. Its partitions go to the others.
  #[instrument(name = "unregister_worker", skip(self))]
  pub async fn unregister(&self, worker_uuid: Uuid) -> Result<(), RegistryError> {
    let _guard = self.lock.lock().await;

    if let Some(instance) = self.repository.find_instance(worker_uuid).await? {
      self.evict(&instance).await?;
    }

    Ok(())
  }

  /// Record that `lease.worker_uuid` started the task run.
  pub async fn save_lease(&self, lease: &WorkerJobRunning) -> Result<(), RegistryError> {
    self.repository.save_lease(lease).await
  }

  /// The attempt of `worker_uuid` is over, nobody needs to re-emit it
  /// anymore. A lease taken since by another worker stays.
  pub async fn delete_lease(
    &self,
    task_run_id: &str,
    worker_uuid: Uuid,
  ) -> Result<(), RegistryError> {
    self.repository.delete_lease(task_run_id, worker_uuid).await
  }

  pub async fn instances(&self) -> Result<Vec<WorkerInstance>, RegistryError> {
    self.repository.list_instances().await
  }

  /// Evict every instance whose last heartbeat is too old at `now`.
  ///
  /// Returns the uuids this call evicted. Instances another registry got to
  /// first are left out.
  #[instrument(name = "check_liveness", skip(self))]
  pub async fn check_liveness(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RegistryError> {
    let _guard = self.lock.lock().await;
    let deadline = now - self.config.expiry();

    let dead: Vec<WorkerInstance> = self
      .repository
      .list_instances()
      .await?
      .into_iter()
      .filter(|instance| instance.last_heartbeat < deadline)
      .collect();

    let mut evicted = Vec::with_capacity(dead.len());
    for instance in dead {
      warn!(
        worker_uuid = %instance.worker_uuid,
        hostname = %instance.hostname,
        last_heartbeat = %instance.last_heartbeat,
        "worker_missed_heartbeats"
      );
      if self.evict(&instance).await? {
        evicted.push(instance.worker_uuid);
      }
    }

    Ok(evicted)
  }

  /// Run [`Registry::check_liveness`] periodically until cancelled.
  pub async fn run_liveness(self: Arc<Self>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(self.config.liveness_check_interval());
    info!("liveness_monitor_started");

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = interval.tick() => {
          if let Err(e) = self.check_liveness(Utc::now()).await {
            error!(error = %e, "liveness_check_failed");
          }
        }
      }
    }

    info!("liveness_monitor_stopped");
  }

  async fn register_locked(
    &self,
    mut instance: WorkerInstance,
  ) -> Result<WorkerInstance, RegistryError> {
    let others: Vec<WorkerInstance> = self
      .repository
      .list_instances()
      .await?
      .into_iter()
      .filter(|other| other.worker_uuid != instance.worker_uuid)
      .filter(|other| other.worker_group == instance.worker_group)
      .collect();

    instance.partitions = assign_partitions(&others, self.config.partitions);
    self.save_and_evict(&instance).await?;

    info!(
      worker_uuid = %instance.worker_uuid,
      hostname = %instance.hostname,
      partitions = ?instance.partitions,
      "worker_registered"
    );

    Ok(instance)
  }

  /// Save `instance` and take its partitions away from the others. Those
  /// left without any partition are evicted.
  async fn save_and_evict(&self, instance: &WorkerInstance) -> Result<(), RegistryError> {
    self.repository.save_instance(instance).await?;

    let all = self.repository.list_instances().await?;
    for other in remove_evicted_partitions(&all, instance) {
      if other.partitions.is_empty() {
        warn!(worker_uuid = %other.worker_uuid, "worker_lost_all_partitions");
        self.evict(&other).await?;
      } else {
        self.repository.save_instance(&other).await?;
      }
    }

    Ok(())
  }

  /// Delete `instance`, re-emit the work it leased and hand its partitions
  /// to the remaining instances of its group.
  ///
  /// Only the caller that actually deleted the record re-emits the leases.
  /// Returns false when the record was already gone.
  async fn evict(&self, instance: &WorkerInstance) -> Result<bool, RegistryError> {
    if !self.repository.delete_instance(instance.worker_uuid).await? {
      debug!(worker_uuid = %instance.worker_uuid, "worker_already_evicted");
      return Ok(false);
    }

    for lease in self.repository.leases_of(instance.worker_uuid).await? {
      let worker_task = lease
        .worker_task
        .with_task_run(lease.worker_task.task_run.on_running_resend());

      warn!(
        worker_uuid = %instance.worker_uuid,
        execution_id = %worker_task.task_run.execution_id,
        task_run_id = %worker_task.task_run.id,
        task = %worker_task.task_run.describe(),
        "re-emitting worker task"
      );

      self.worker_task_queue.emit(&worker_task).await?;
      self
        .repository
        .delete_lease(&lease.task_run_id, instance.worker_uuid)
        .await?;
    }

    let remaining: Vec<WorkerInstance> = self
      .repository
      .list_instances()
      .await?
      .into_iter()
      .filter(|other| other.worker_group == instance.worker_group)
      .collect();

    for updated in redistribute_partitions(&remaining, &instance.partitions) {
      self.repository.save_instance(&updated).await?;
    }

    info!(worker_uuid = %instance.worker_uuid, "worker_evicted");
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::MemoryInstanceRepository;
  use flowrun_queue::{MemoryQueue, QueueConfig};

  fn registry(partitions: i32) -> Registry {
    let config = RegistryConfig {
      partitions,
      ..Default::default()
    };
    Registry::new(
      Arc::new(MemoryInstanceRepository::new()),
      Queue::new(Arc::new(MemoryQueue::new()), QueueConfig::default()),
      config,
    )
  }

  fn owned(instances: &[WorkerInstance]) -> Vec<i32> {
    let mut all: Vec<i32> = instances
      .iter()
      .flat_map(|i| i.partitions.iter().copied())
      .collect();
    all.sort();
    all
  }

  #[tokio::test]
  async fn test_partitions_stay_exclusive() {
    let registry = registry(8);

    for _ in 0..3 {
      registry.register("host", None).await.unwrap();
    }

    let instances = registry.instances().await.unwrap();
    assert_eq!(instances.len(), 3);
    assert_eq!(owned(&instances), (0..8).collect::<Vec<_>>());
    assert!(instances.iter().all(|i| !i.partitions.is_empty()));
  }

  #[tokio::test]
  async fn test_groups_have_their_own_partitions() {
    let registry = registry(4);

    let default = registry.register("host", None).await.unwrap();
    let gpu = registry
      .register("host", Some("gpu".to_string()))
      .await
      .unwrap();

    assert_eq!(default.partitions.len(), 4);
    assert_eq!(gpu.partitions.len(), 4);
  }

  #[tokio::test]
  async fn test_heartbeat_after_eviction_registers_again() {
    let registry = registry(4);
    let instance = registry.register("host", None).await.unwrap();

    registry.unregister(instance.worker_uuid).await.unwrap();
    assert!(registry.instances().await.unwrap().is_empty());

    let again = registry.heartbeat(&instance).await.unwrap();
    assert_eq!(again.worker_uuid, instance.worker_uuid);
    assert_eq!(again.partitions.len(), 4);
  }

  #[tokio::test]
  async fn test_heartbeat_keeps_instance_alive() {
    let registry = registry(4);
    let instance = registry.register("host", None).await.unwrap();

    let later = Utc::now() + registry.config().expiry() / 2;
    let refreshed = registry.heartbeat(&instance).await.unwrap();
    assert!(refreshed.last_heartbeat >= instance.last_heartbeat);

    assert!(registry.check_liveness(later).await.unwrap().is_empty());
  }
}
