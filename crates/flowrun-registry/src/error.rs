use flowrun_queue::QueueError;

/// Error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A stored record could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Orphaned work could not be re-emitted.
  #[error("queue error: {0}")]
  Queue(#[from] QueueError),
}
