use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::trace;

use crate::{DedupError, Deduplicator};

/// SQLite-based [`Deduplicator`].
pub struct SqliteDeduplicator {
  pool: SqlitePool,
}

impl SqliteDeduplicator {
  /// Create a new SQLite deduplicator with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl Deduplicator for SqliteDeduplicator {
  async fn deduplicate(
    &self,
    execution_id: &str,
    key: &str,
    value: &str,
  ) -> Result<bool, DedupError> {
    // the upsert touches no row when the stored value is the same
    let result = sqlx::query(
      r#"
            INSERT INTO dedup_keys (execution_id, key, value)
            VALUES (?, ?, ?)
            ON CONFLICT (execution_id, key) DO UPDATE
            SET value = excluded.value
            WHERE dedup_keys.value <> excluded.value
            "#,
    )
    .bind(execution_id)
    .bind(key)
    .bind(value)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      trace!(execution_id, key, value, "dedup_dropped");
      return Ok(false);
    }

    Ok(true)
  }

  async fn purge(&self, execution_id: &str) -> Result<(), DedupError> {
    sqlx::query("DELETE FROM dedup_keys WHERE execution_id = ?")
      .bind(execution_id)
      .execute(&self.pool)
      .await?;

    Ok(())
  }
}
