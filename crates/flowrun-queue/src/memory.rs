use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use crate::backend::{Claimed, QueueBackend, Record};
use crate::error::QueueError;
use crate::message::QueueType;

struct Claim {
  token: String,
  claimed_at: Instant,
  acked: bool,
}

#[derive(Default)]
struct Inner {
  log: Vec<(QueueType, Record)>,
  claims: HashMap<(String, i64), Claim>,
  last_offset: i64,
}

/// In-process [`QueueBackend`].
///
/// Everything lives behind one mutex, which makes claims atomic. Waiting
/// consumers are woken up as soon as a record is emitted.
pub struct MemoryQueue {
  inner: Mutex<Inner>,
  notify: watch::Sender<i64>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    let (notify, _) = watch::channel(0);
    Self {
      inner: Mutex::new(Inner::default()),
      notify,
    }
  }
}

impl Default for MemoryQueue {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
  async fn emit(&self, queue: QueueType, key: &str, payload: String) -> Result<i64, QueueError> {
    let offset = {
      let mut inner = self.inner.lock().await;
      inner.last_offset += 1;
      let offset = inner.last_offset;
      inner.log.push((
        queue,
        Record {
          offset,
          key: key.to_string(),
          payload,
        },
      ));
      offset
    };

    self.notify.send_replace(offset);
    Ok(offset)
  }

  async fn claim(
    &self,
    queue: QueueType,
    group: &str,
    limit: usize,
    visibility: Duration,
  ) -> Result<Vec<Claimed>, QueueError> {
    let mut guard = self.inner.lock().await;
    let inner = &mut *guard;
    let now = Instant::now();
    let mut claimed = Vec::new();

    for (record_queue, record) in &inner.log {
      if claimed.len() >= limit {
        break;
      }
      if *record_queue != queue {
        continue;
      }

      let key = (group.to_string(), record.offset);
      let available = match inner.claims.get(&key) {
        None => true,
        Some(claim) => !claim.acked && now.duration_since(claim.claimed_at) >= visibility,
      };
      if !available {
        continue;
      }

      let token = uuid::Uuid::new_v4().to_string();
      inner.claims.insert(
        key,
        Claim {
          token: token.clone(),
          claimed_at: now,
          acked: false,
        },
      );
      claimed.push(Claimed {
        record: record.clone(),
        token,
      });
    }

    Ok(claimed)
  }

  async fn ack(&self, group: &str, offset: i64, token: &str) -> Result<(), QueueError> {
    let mut inner = self.inner.lock().await;
    if let Some(claim) = inner.claims.get_mut(&(group.to_string(), offset)) {
      if claim.token == token {
        claim.acked = true;
      }
    }
    Ok(())
  }

  async fn read_after(
    &self,
    queue: QueueType,
    offset: i64,
    limit: usize,
  ) -> Result<Vec<Record>, QueueError> {
    let inner = self.inner.lock().await;
    Ok(
      inner
        .log
        .iter()
        .filter(|(record_queue, record)| *record_queue == queue && record.offset > offset)
        .take(limit)
        .map(|(_, record)| record.clone())
        .collect(),
    )
  }

  async fn trim(&self, queue: QueueType, group: &str) -> Result<u64, QueueError> {
    let mut guard = self.inner.lock().await;
    let inner = &mut *guard;

    let acked = |offset: i64| {
      inner
        .claims
        .get(&(group.to_string(), offset))
        .is_some_and(|claim| claim.acked)
    };
    let bound = inner
      .log
      .iter()
      .filter(|(record_queue, _)| *record_queue == queue)
      .map(|(_, record)| record.offset)
      .find(|offset| !acked(*offset))
      .unwrap_or(i64::MAX);

    let before = inner.log.len();
    inner
      .log
      .retain(|(record_queue, record)| *record_queue != queue || record.offset >= bound);
    let kept: HashSet<i64> = inner.log.iter().map(|(_, record)| record.offset).collect();
    inner.claims.retain(|(_, offset), _| kept.contains(offset));

    Ok((before - inner.log.len()) as u64)
  }

  async fn max_offset(&self, queue: QueueType) -> Result<i64, QueueError> {
    let inner = self.inner.lock().await;
    Ok(
      inner
        .log
        .iter()
        .rev()
        .find(|(record_queue, _)| *record_queue == queue)
        .map_or(0, |(_, record)| record.offset),
    )
  }

  async fn wait(&self, timeout: Duration) {
    let mut rx = self.notify.subscribe();
    let _ = tokio::time::timeout(timeout, rx.changed()).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const VISIBILITY: Duration = Duration::from_secs(60);

  #[tokio::test]
  async fn test_offsets_increase() {
    let queue = MemoryQueue::new();

    let first = queue
      .emit(QueueType::Execution, "a", "{}".to_string())
      .await
      .unwrap();
    let second = queue
      .emit(QueueType::WorkerTask, "b", "{}".to_string())
      .await
      .unwrap();

    assert!(second > first);
    assert_eq!(queue.max_offset(QueueType::Execution).await.unwrap(), first);
    assert_eq!(queue.max_offset(QueueType::Trigger).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_claim_once_per_group() {
    let queue = MemoryQueue::new();
    queue
      .emit(QueueType::WorkerTask, "a", "1".to_string())
      .await
      .unwrap();

    let first = queue
      .claim(QueueType::WorkerTask, "worker", 10, VISIBILITY)
      .await
      .unwrap();
    let again = queue
      .claim(QueueType::WorkerTask, "worker", 10, VISIBILITY)
      .await
      .unwrap();
    let other = queue
      .claim(QueueType::WorkerTask, "other", 10, VISIBILITY)
      .await
      .unwrap();

    assert_eq!(first.len(), 1);
    assert!(again.is_empty());
    assert_eq!(other.len(), 1);
  }

  #[tokio::test]
  async fn test_expired_claim_is_handed_out_again() {
    let queue = MemoryQueue::new();
    queue
      .emit(QueueType::WorkerTask, "a", "1".to_string())
      .await
      .unwrap();

    let first = queue
      .claim(QueueType::WorkerTask, "worker", 10, Duration::ZERO)
      .await
      .unwrap();
    let second = queue
      .claim(QueueType::WorkerTask, "worker", 10, Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(first[0].token, second[0].token);

    // the stale token can't acknowledge the new claim
    queue.ack("worker", 1, &first[0].token).await.unwrap();
    let third = queue
      .claim(QueueType::WorkerTask, "worker", 10, Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(third.len(), 1);

    queue.ack("worker", 1, &third[0].token).await.unwrap();
    let fourth = queue
      .claim(QueueType::WorkerTask, "worker", 10, Duration::ZERO)
      .await
      .unwrap();
    assert!(fourth.is_empty());
  }

  #[tokio::test]
  async fn test_wait_wakes_on_emit() {
    let queue = std::sync::Arc::new(MemoryQueue::new());
    let waiter = queue.clone();

    let handle = tokio::spawn(async move {
      let start = std::time::Instant::now();
      waiter.wait(Duration::from_secs(10)).await;
      start.elapsed()
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue
      .emit(QueueType::Execution, "a", "{}".to_string())
      .await
      .unwrap();

    let elapsed = handle.await.unwrap();
    assert!(elapsed < Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_trim_stops_at_first_pending_record() {
    let queue = MemoryQueue::new();
    for key in ["a", "b", "c"] {
      queue
        .emit(QueueType::WorkerTaskResult, key, "{}".to_string())
        .await
        .unwrap();
    }
    let other = queue
      .emit(QueueType::Execution, "x", "{}".to_string())
      .await
      .unwrap();

    let claimed = queue
      .claim(QueueType::WorkerTaskResult, "executor", 10, VISIBILITY)
      .await
      .unwrap();
    // acknowledge the first and the last only
    queue.ack("executor", claimed[0].record.offset, &claimed[0].token).await.unwrap();
    queue.ack("executor", claimed[2].record.offset, &claimed[2].token).await.unwrap();

    let trimmed = queue.trim(QueueType::WorkerTaskResult, "executor").await.unwrap();
    assert_eq!(trimmed, 1);

    let left: Vec<String> = queue
      .read_after(QueueType::WorkerTaskResult, 0, 10)
      .await
      .unwrap()
      .into_iter()
      .map(|record| record.key)
      .collect();
    assert_eq!(left, vec!["b", "c"]);
    assert_eq!(queue.read_after(QueueType::Execution, 0, 10).await.unwrap().len(), 1);

    queue.ack("executor", claimed[1].record.offset, &claimed[1].token).await.unwrap();
    assert_eq!(queue.trim(QueueType::WorkerTaskResult, "executor").await.unwrap(), 2);

    // offsets keep growing after a trim
    let next = queue
      .emit(QueueType::WorkerTaskResult, "d", "{}".to_string())
      .await
      .unwrap();
    assert!(next > other);
  }
}
