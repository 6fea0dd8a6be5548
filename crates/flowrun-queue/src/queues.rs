use std::sync::Arc;

use flowrun_config::Flow;
use flowrun_model::{Execution, ExecutionKilled, WorkerTask, WorkerTaskResult};

use crate::backend::QueueBackend;
use crate::config::QueueConfig;
use crate::queue::Queue;

/// Every queue the executor and the workers talk through, over one backend.
#[derive(Clone)]
pub struct Queues {
  pub execution: Queue<Execution>,
  pub worker_task: Queue<WorkerTask>,
  pub worker_task_result: Queue<WorkerTaskResult>,
  pub execution_killed: Queue<ExecutionKilled>,
  pub flow: Queue<Flow>,
}

impl Queues {
  pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
    Self {
      execution: Queue::new(backend.clone(), config.clone()),
      worker_task: Queue::new(backend.clone(), config.clone()),
      worker_task_result: Queue::new(backend.clone(), config.clone()),
      execution_killed: Queue::new(backend.clone(), config.clone()),
      flow: Queue::new(backend, config),
    }
  }
}
