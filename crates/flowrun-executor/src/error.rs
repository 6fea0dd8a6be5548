use flowrun_dedup::DedupError;
use flowrun_model::ModelError;
use flowrun_queue::QueueError;
use flowrun_registry::RegistryError;
use flowrun_resolver::ResolverError;
use flowrun_store::StoreError;

/// Errors raised while driving an execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  /// The flow revision an execution refers to is unknown.
  #[error("flow '{namespace}.{flow_id}' revision {revision} not found")]
  FlowNotFound {
    namespace: String,
    flow_id: String,
    revision: u32,
  },

  /// Processing kept producing changes.
  #[error("execution '{execution_id}' did not settle after {iterations} passes")]
  NotConverging {
    execution_id: String,
    iterations: u32,
  },

  /// Every replay of an update hit a concurrent write.
  #[error("execution '{0}' kept changing concurrently, giving up")]
  ConflictRetriesExhausted(String),

  /// Only a terminated execution can be restarted.
  #[error("execution '{execution_id}' is {state}, only terminated executions restart")]
  NotRestartable { execution_id: String, state: String },

  #[error(transparent)]
  Resolver(#[from] ResolverError),

  #[error(transparent)]
  Model(#[from] ModelError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error(transparent)]
  Dedup(#[from] DedupError),

  #[error(transparent)]
  Registry(#[from] RegistryError),
}
