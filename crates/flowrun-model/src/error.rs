use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
  /// A broken precondition: the caller holds a view of the execution that
  /// does not match the stored one.
  #[error("invariant violation on execution '{execution_id}': {message}")]
  InvariantViolation {
    execution_id: String,
    message: String,
  },
}
