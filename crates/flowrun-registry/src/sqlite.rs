use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrun_model::{WorkerInstance, WorkerJobRunning, WorkerTask};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::repository::InstanceRepository;

#[derive(sqlx::FromRow)]
struct InstanceRow {
  worker_uuid: String,
  hostname: String,
  worker_group: Option<String>,
  partitions: Json<BTreeSet<i32>>,
  started_at: DateTime<Utc>,
  last_heartbeat: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for WorkerInstance {
  type Error = RegistryError;

  fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
    Ok(WorkerInstance {
      worker_uuid: parse_uuid(&row.worker_uuid)?,
      hostname: row.hostname,
      worker_group: row.worker_group,
      partitions: row.partitions.0,
      started_at: row.started_at,
      last_heartbeat: row.last_heartbeat,
    })
  }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
  task_run_id: String,
  worker_uuid: String,
  lease_timestamp: DateTime<Utc>,
  worker_task: Json<WorkerTask>,
}

impl TryFrom<LeaseRow> for WorkerJobRunning {
  type Error = RegistryError;

  fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
    Ok(WorkerJobRunning {
      task_run_id: row.task_run_id,
      worker_uuid: parse_uuid(&row.worker_uuid)?,
      lease_timestamp: row.lease_timestamp,
      worker_task: row.worker_task.0,
    })
  }
}

fn parse_uuid(value: &str) -> Result<Uuid, RegistryError> {
  Uuid::parse_str(value).map_err(|e| RegistryError::Database(sqlx::Error::Decode(Box::new(e))))
}

/// SQLite-based [`InstanceRepository`].
pub struct SqliteInstanceRepository {
  pool: SqlitePool,
}

impl SqliteInstanceRepository {
  /// Create a new SQLite repository with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl InstanceRepository for SqliteInstanceRepository {
  async fn list_instances(&self) -> Result<Vec<WorkerInstance>, RegistryError> {
    let rows: Vec<InstanceRow> = sqlx::query_as(
      r#"
            SELECT worker_uuid, hostname, worker_group, partitions, started_at, last_heartbeat
            FROM worker_instances
            ORDER BY started_at, worker_uuid
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(WorkerInstance::try_from).collect()
  }

  async fn find_instance(
    &self,
    worker_uuid: Uuid,
  ) -> Result<Option<WorkerInstance>, RegistryError> {
    let row: Option<InstanceRow> = sqlx::query_as(
      r#"
            SELECT worker_uuid, hostname, worker_group, partitions, started_at, last_heartbeat
            FROM worker_instances
            WHERE worker_uuid = ?
            "#,
    )
    .bind(worker_uuid.to_string())
    .fetch_optional(&self.pool)
    .await?;

    row.map(WorkerInstance::try_from).transpose()
  }

  async fn save_instance(&self, instance: &WorkerInstance) -> Result<(), RegistryError> {
    sqlx::query(
      r#"
            INSERT INTO worker_instances (worker_uuid, hostname, worker_group, partitions, started_at, last_heartbeat)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (worker_uuid) DO UPDATE
            SET hostname = excluded.hostname,
                worker_group = excluded.worker_group,
                partitions = excluded.partitions,
                last_heartbeat = excluded.last_heartbeat
            "#,
    )
    .bind(instance.worker_uuid.to_string())
    .bind(&instance.hostname)
    .bind(&instance.worker_group)
    .bind(Json(&instance.partitions))
    .bind(instance.started_at)
    .bind(instance.last_heartbeat)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn delete_instance(&self, worker_uuid: Uuid) -> Result<bool, RegistryError> {
    let result = sqlx::query("DELETE FROM worker_instances WHERE worker_uuid = ?")
      .bind(worker_uuid.to_string())
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected() > 0)
  }

  async fn save_lease(&self, lease: &WorkerJobRunning) -> Result<(), RegistryError> {
    sqlx::query(
      r#"
            INSERT OR REPLACE INTO worker_job_running (task_run_id, worker_uuid, lease_timestamp, worker_task)
            VALUES (?, ?, ?, ?)
            "#,
    )
    .bind(&lease.task_run_id)
    .bind(lease.worker_uuid.to_string())
    .bind(lease.lease_timestamp)
    .bind(Json(&lease.worker_task))
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn delete_lease(
    &self,
    task_run_id: &str,
    worker_uuid: Uuid,
  ) -> Result<(), RegistryError> {
    sqlx::query("DELETE FROM worker_job_running WHERE task_run_id = ? AND worker_uuid = ?")
      .bind(task_run_id)
      .bind(worker_uuid.to_string())
      .execute(&self.pool)
      .await?;

    Ok(())
  }

  async fn leases_of(&self, worker_uuid: Uuid) -> Result<Vec<WorkerJobRunning>, RegistryError> {
    let rows: Vec<LeaseRow> = sqlx::query_as(
      r#"
            SELECT task_run_id, worker_uuid, lease_timestamp, worker_task
            FROM worker_job_running
            WHERE worker_uuid = ?
            ORDER BY lease_timestamp
            "#,
    )
    .bind(worker_uuid.to_string())
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(WorkerJobRunning::try_from).collect()
  }
}
