use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{DedupError, Deduplicator};

/// In-memory [`Deduplicator`].
#[derive(Default)]
pub struct MemoryDeduplicator {
  /// execution_id -> key -> last value.
  keys: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryDeduplicator {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Deduplicator for MemoryDeduplicator {
  async fn deduplicate(
    &self,
    execution_id: &str,
    key: &str,
    value: &str,
  ) -> Result<bool, DedupError> {
    let mut keys = self.keys.write().await;
    let execution = keys.entry(execution_id.to_string()).or_default();

    if execution.get(key).is_some_and(|stored| stored == value) {
      trace!(execution_id, key, value, "dedup_dropped");
      return Ok(false);
    }

    execution.insert(key.to_string(), value.to_string());
    Ok(true)
  }

  async fn purge(&self, execution_id: &str) -> Result<(), DedupError> {
    self.keys.write().await.remove(execution_id);
    Ok(())
  }
}
