use crate::message::QueueType;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A message could not be serialized.
  #[error("failed to encode message: {0}")]
  Encode(#[from] serde_json::Error),
}

/// A record of the log that could not be decoded into the expected message.
///
/// Handed to the handler instead of the message, then acknowledged: a bad
/// record never blocks the queue.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed {queue} message at offset {offset} (key '{key}'): {error}")]
pub struct MalformedMessage {
  pub queue: QueueType,
  pub offset: i64,
  pub key: String,
  pub payload: String,
  pub error: String,
}
