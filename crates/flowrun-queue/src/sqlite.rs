use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::backend::{Claimed, QueueBackend, Record};
use crate::error::QueueError;
use crate::message::QueueType;

/// SQLite-based [`QueueBackend`].
///
/// Claims are rows of `queue_claims`, keyed by consumer group and message:
/// a claim is taken by a single `INSERT OR IGNORE ... SELECT` statement, so
/// two pollers of the same group never get the same record.
pub struct SqliteQueue {
  pool: SqlitePool,
}

impl SqliteQueue {
  /// Create a new SQLite queue with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
  async fn emit(&self, queue: QueueType, key: &str, payload: String) -> Result<i64, QueueError> {
    let result = sqlx::query(
      r#"
            INSERT INTO queue_messages (queue, key, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
    )
    .bind(queue.as_str())
    .bind(key)
    .bind(payload)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(result.last_insert_rowid())
  }

  async fn claim(
    &self,
    queue: QueueType,
    group: &str,
    limit: usize,
    visibility: Duration,
  ) -> Result<Vec<Claimed>, QueueError> {
    let token = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().timestamp_millis();
    let expired_before = now - visibility.as_millis() as i64;
    let limit = limit as i64;

    // fresh records first
    sqlx::query(
      r#"
            INSERT OR IGNORE INTO queue_claims (consumer_group, message_id, claim_token, claimed_at, acked)
            SELECT ?, m.id, ?, ?, 0
            FROM queue_messages m
            WHERE m.queue = ?
              AND NOT EXISTS (
                SELECT 1 FROM queue_claims c
                WHERE c.consumer_group = ? AND c.message_id = m.id
              )
            ORDER BY m.id
            LIMIT ?
            "#,
    )
    .bind(group)
    .bind(&token)
    .bind(now)
    .bind(queue.as_str())
    .bind(group)
    .bind(limit)
    .execute(&self.pool)
    .await?;

    // then claims whose consumer never acknowledged them
    sqlx::query(
      r#"
            UPDATE queue_claims
            SET claim_token = ?, claimed_at = ?
            WHERE consumer_group = ?
              AND message_id IN (
                SELECT c.message_id
                FROM queue_claims c
                JOIN queue_messages m ON m.id = c.message_id
                WHERE c.consumer_group = ?
                  AND m.queue = ?
                  AND c.acked = 0
                  AND c.claimed_at <= ?
                  AND c.claim_token <> ?
                ORDER BY c.message_id
                LIMIT ?
              )
            "#,
    )
    .bind(&token)
    .bind(now)
    .bind(group)
    .bind(group)
    .bind(queue.as_str())
    .bind(expired_before)
    .bind(&token)
    .bind(limit)
    .execute(&self.pool)
    .await?;

    let rows = sqlx::query(
      r#"
            SELECT m.id, m.key, m.payload
            FROM queue_claims c
            JOIN queue_messages m ON m.id = c.message_id
            WHERE c.consumer_group = ? AND c.claim_token = ? AND c.acked = 0
            ORDER BY m.id
            "#,
    )
    .bind(group)
    .bind(&token)
    .fetch_all(&self.pool)
    .await?;

    rows
      .into_iter()
      .map(|row| -> Result<Claimed, QueueError> {
        Ok(Claimed {
          record: Record {
            offset: row.try_get("id")?,
            key: row.try_get("key")?,
            payload: row.try_get("payload")?,
          },
          token: token.clone(),
        })
      })
      .collect()
  }

  async fn ack(&self, group: &str, offset: i64, token: &str) -> Result<(), QueueError> {
    sqlx::query(
      r#"
            UPDATE queue_claims
            SET acked = 1
            WHERE consumer_group = ? AND message_id = ? AND claim_token = ?
            "#,
    )
    .bind(group)
    .bind(offset)
    .bind(token)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn read_after(
    &self,
    queue: QueueType,
    offset: i64,
    limit: usize,
  ) -> Result<Vec<Record>, QueueError> {
    let rows = sqlx::query(
      r#"
            SELECT id, key, payload
            FROM queue_messages
            WHERE queue = ? AND id > ?
            ORDER BY id
            LIMIT ?
            "#,
    )
    .bind(queue.as_str())
    .bind(offset)
    .bind(limit as i64)
    .fetch_all(&self.pool)
    .await?;

    rows
      .into_iter()
      .map(|row| -> Result<Record, QueueError> {
        Ok(Record {
          offset: row.try_get("id")?,
          key: row.try_get("key")?,
          payload: row.try_get("payload")?,
        })
      })
      .collect()
  }

  async fn trim(&self, queue: QueueType, group: &str) -> Result<u64, QueueError> {
    let pending: Option<i64> = sqlx::query_scalar(
      r#"
            SELECT MIN(m.id)
            FROM queue_messages m
            WHERE m.queue = ?
              AND NOT EXISTS (
                SELECT 1 FROM queue_claims c
                WHERE c.message_id = m.id AND c.consumer_group = ? AND c.acked = 1
              )
            "#,
    )
    .bind(queue.as_str())
    .bind(group)
    .fetch_one(&self.pool)
    .await?;
    let bound = pending.unwrap_or(i64::MAX);

    let mut tx = self.pool.begin().await?;
    sqlx::query(
      r#"
            DELETE FROM queue_claims
            WHERE message_id IN (
              SELECT id FROM queue_messages WHERE queue = ? AND id < ?
            )
            "#,
    )
    .bind(queue.as_str())
    .bind(bound)
    .execute(&mut *tx)
    .await?;
    let result = sqlx::query("DELETE FROM queue_messages WHERE queue = ? AND id < ?")
      .bind(queue.as_str())
      .bind(bound)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;

    Ok(result.rows_affected())
  }

  async fn max_offset(&self, queue: QueueType) -> Result<i64, QueueError> {
    let offset: Option<i64> =
      sqlx::query_scalar("SELECT MAX(id) FROM queue_messages WHERE queue = ?")
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await?;

    Ok(offset.unwrap_or(0))
  }

  async fn wait(&self, timeout: Duration) {
    // other processes write to the same file, polling is all we can do
    tokio::time::sleep(timeout).await;
  }
}
