use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, created on first use.
#[derive(Default)]
pub struct KeyedLock {
  locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLock {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`.
  pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().await;
      locks.entry(key.to_string()).or_default().clone()
    };
    lock.lock_owned().await
  }

  /// Drop the mutex of `key`. Holders and waiters keep theirs.
  pub async fn forget(&self, key: &str) {
    self.locks.lock().await.remove(key);
  }

  pub async fn tracked(&self) -> usize {
    self.locks.lock().await.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_same_key_is_exclusive() {
    let locks = Arc::new(KeyedLock::new());
    let counter = Arc::new(Mutex::new(Vec::new()));

    let guard = locks.lock("a").await;
    let task = {
      let locks = locks.clone();
      let counter = counter.clone();
      tokio::spawn(async move {
        let _guard = locks.lock("a").await;
        counter.lock().await.push("second");
      })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    counter.lock().await.push("first");
    drop(guard);
    task.await.unwrap();

    assert_eq!(*counter.lock().await, vec!["first", "second"]);
  }

  #[tokio::test]
  async fn test_other_keys_do_not_wait() {
    let locks = KeyedLock::new();
    let _a = locks.lock("a").await;
    let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b"))
      .await
      .unwrap();

    locks.forget("a").await;
    assert_eq!(locks.tracked().await, 1);
  }
}
