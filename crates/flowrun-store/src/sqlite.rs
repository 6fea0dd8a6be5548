use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flowrun_model::Execution;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::debug;

use crate::error::StoreError;
use crate::{ExecutionStore, Versioned};

/// Open (and create if needed) the SQLite database at `path`.
///
/// WAL mode and a busy timeout let several processes share the file.
pub async fn connect(path: &Path) -> Result<SqlitePool, StoreError> {
  let url = format!("sqlite://{}", path.display());
  let options = SqliteConnectOptions::from_str(&url)?
    .create_if_missing(true)
    .journal_mode(SqliteJournalMode::Wal)
    .busy_timeout(Duration::from_secs(10));

  let pool = SqlitePoolOptions::new()
    .max_connections(8)
    .connect_with(options)
    .await?;

  debug!(path = %path.display(), "database_connected");
  Ok(pool)
}

/// Run database migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
  sqlx::migrate!("../../migrations").run(pool).await?;
  Ok(())
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
  version: i64,
  body: Json<Execution>,
}

/// SQLite-based [`ExecutionStore`].
pub struct SqliteExecutionStore {
  pool: SqlitePool,
}

impl SqliteExecutionStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  async fn current_version(&self, execution_id: &str) -> Result<Option<i64>, StoreError> {
    let version = sqlx::query_scalar("SELECT version FROM executions WHERE id = ?")
      .bind(execution_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(version)
  }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
  async fn find(&self, execution_id: &str) -> Result<Option<Versioned>, StoreError> {
    let row: Option<ExecutionRow> = sqlx::query_as(
      r#"
            SELECT version, body
            FROM executions
            WHERE id = ?
            "#,
    )
    .bind(execution_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(|row| Versioned {
      execution: row.body.0,
      version: row.version,
    }))
  }

  async fn save(
    &self,
    execution: &Execution,
    expected_version: Option<i64>,
  ) -> Result<i64, StoreError> {
    let body = Json(execution);
    let state = execution.state.current.as_str();

    let (result, version) = match expected_version {
      None => {
        let result = sqlx::query(
          r#"
                INSERT OR IGNORE INTO executions (id, namespace, flow_id, state, version, body, updated_at)
                VALUES (?, ?, ?, ?, 1, ?, ?)
                "#,
        )
        .bind(&execution.id)
        .bind(&execution.namespace)
        .bind(&execution.flow_id)
        .bind(state)
        .bind(&body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        (result, 1)
      }
      Some(expected) => {
        let result = sqlx::query(
          r#"
                UPDATE executions
                SET state = ?, version = version + 1, body = ?, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
        )
        .bind(state)
        .bind(&body)
        .bind(Utc::now())
        .bind(&execution.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        (result, expected + 1)
      }
    };

    if result.rows_affected() == 0 {
      return Err(StoreError::Conflict {
        execution_id: execution.id.clone(),
        expected: expected_version,
        found: self.current_version(&execution.id).await?,
      });
    }

    Ok(version)
  }

  async fn list_running(&self) -> Result<Vec<Execution>, StoreError> {
    let rows: Vec<ExecutionRow> = sqlx::query_as(
      r#"
            SELECT version, body
            FROM executions
            WHERE state NOT IN ('SUCCESS', 'WARNING', 'FAILED', 'KILLED', 'CANCELLED', 'SKIPPED')
            ORDER BY updated_at
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(|row| row.body.0).collect())
  }
}
