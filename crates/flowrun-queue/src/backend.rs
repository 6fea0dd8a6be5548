use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::message::QueueType;

/// One entry of a log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  pub offset: i64,
  pub key: String,
  pub payload: String,
}

/// A record handed to one member of a consumer group.
///
/// `token` identifies this claim: acknowledging with the token of an older,
/// expired claim has no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
  pub record: Record,
  pub token: String,
}

/// Storage behind a [`crate::Queue`].
#[async_trait]
pub trait QueueBackend: Send + Sync {
  /// Append a record, returning its offset.
  async fn emit(&self, queue: QueueType, key: &str, payload: String) -> Result<i64, QueueError>;

  /// Claim up to `limit` records of `queue` for `group`, in offset order.
  ///
  /// Records never claimed by the group come first, then claims older than
  /// `visibility` that were never acknowledged.
  async fn claim(
    &self,
    queue: QueueType,
    group: &str,
    limit: usize,
    visibility: Duration,
  ) -> Result<Vec<Claimed>, QueueError>;

  /// Acknowledge a claim: the record is never handed to `group` again.
  async fn ack(&self, group: &str, offset: i64, token: &str) -> Result<(), QueueError>;

  /// Up to `limit` records of `queue` after `offset`.
  async fn read_after(
    &self,
    queue: QueueType,
    offset: i64,
    limit: usize,
  ) -> Result<Vec<Record>, QueueError>;

  /// Delete the records of `queue` that come before the first one `group`
  /// has not acknowledged, with their claims. Returns how many went.
  ///
  /// Only for logs `group` is the sole reader of.
  async fn trim(&self, queue: QueueType, group: &str) -> Result<u64, QueueError>;

  /// Offset of the last record of `queue`, 0 when empty.
  async fn max_offset(&self, queue: QueueType) -> Result<i64, QueueError>;

  /// Wait for new records, at most `timeout`.
  async fn wait(&self, timeout: Duration);
}
