use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowrun_config::Flow;
use flowrun_queue::{Queue, QueueError};
use flowrun_resolver::validate_flow;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

/// Read access to the flow definitions executions refer to.
#[async_trait]
pub trait FlowRepository: Send + Sync {
  async fn find_flow(&self, namespace: &str, flow_id: &str, revision: u32) -> Option<Arc<Flow>>;
}

type FlowKey = (String, String, u32);

/// Every flow revision published on the flow queue, kept in memory.
///
/// The cache reads the flow log from its first record and catches up again
/// whenever a lookup misses, so a flow published just before an execution
/// referring to it is always found.
#[derive(Default)]
pub struct FlowCache {
  flows: RwLock<HashMap<FlowKey, Arc<Flow>>>,
  source: Option<Queue<Flow>>,
  /// Last offset of `source` read.
  offset: Mutex<i64>,
}

impl FlowCache {
  /// A cache only filled through [`FlowCache::put`].
  pub fn new() -> Self {
    Self::default()
  }

  /// A cache following the flow queue.
  pub fn from_queue(queue: Queue<Flow>) -> Self {
    Self {
      source: Some(queue),
      ..Self::default()
    }
  }

  /// Add or replace a flow revision. Invalid definitions are refused.
  pub async fn put(&self, flow: Flow) -> bool {
    if let Err(e) = validate_flow(&flow) {
      error!(flow = %flow.uid(), error = %e, "invalid_flow_ignored");
      return false;
    }

    debug!(flow = %flow.uid(), "flow_cached");
    let key = (flow.namespace.clone(), flow.id.clone(), flow.revision);
    self.flows.write().await.insert(key, Arc::new(flow));
    true
  }

  /// Read the flows published since the last call.
  pub async fn refresh(&self) -> Result<usize, QueueError> {
    let Some(source) = &self.source else {
      return Ok(0);
    };

    let mut offset = self.offset.lock().await;
    let mut loaded = 0;
    loop {
      let records = source.read_after(*offset).await?;
      if records.is_empty() {
        return Ok(loaded);
      }

      for (record_offset, message) in records {
        *offset = record_offset;
        if let Ok(flow) = message {
          if self.put(flow).await {
            loaded += 1;
          }
        }
      }
    }
  }

  async fn cached(&self, key: &FlowKey) -> Option<Arc<Flow>> {
    self.flows.read().await.get(key).cloned()
  }
}

#[async_trait]
impl FlowRepository for FlowCache {
  async fn find_flow(&self, namespace: &str, flow_id: &str, revision: u32) -> Option<Arc<Flow>> {
    let key = (namespace.to_string(), flow_id.to_string(), revision);
    if let Some(flow) = self.cached(&key).await {
      return Some(flow);
    }

    if let Err(e) = self.refresh().await {
      error!(error = %e, "flow_refresh_failed");
    }
    self.cached(&key).await
  }
}
