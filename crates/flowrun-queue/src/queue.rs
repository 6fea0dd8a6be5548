use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::backend::{QueueBackend, Record};
use crate::config::QueueConfig;
use crate::error::{MalformedMessage, QueueError};
use crate::message::QueueMessage;

/// Where a broadcast subscriber starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
  /// Replay the whole log.
  Earliest,
  /// Only records emitted after subscribing.
  Latest,
}

/// A running consumer loop.
///
/// Dropping the subscription leaves the loop running, call
/// [`Subscription::shutdown`] to stop it.
pub struct Subscription {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

impl Subscription {
  /// Ask the loop to stop after the record it is handling.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Stop the loop and wait for it.
  pub async fn shutdown(self) {
    self.cancel.cancel();
    let _ = self.handle.await;
  }
}

/// Typed access to the log of `T` messages.
pub struct Queue<T> {
  backend: Arc<dyn QueueBackend>,
  config: QueueConfig,
  _message: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
  fn clone(&self) -> Self {
    Self {
      backend: self.backend.clone(),
      config: self.config.clone(),
      _message: PhantomData,
    }
  }
}

impl<T: QueueMessage> Queue<T> {
  pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
    Self {
      backend,
      config,
      _message: PhantomData,
    }
  }

  pub fn backend(&self) -> &Arc<dyn QueueBackend> {
    &self.backend
  }

  /// Append `message`, returning its offset.
  pub async fn emit(&self, message: &T) -> Result<i64, QueueError> {
    let payload = serde_json::to_string(message)?;
    self
      .backend
      .emit(T::TYPE, &message.key(), payload)
      .await
  }

  /// Drop the records `group` is done with. See [`QueueBackend::trim`].
  pub async fn trim(&self, group: &str) -> Result<u64, QueueError> {
    self.backend.trim(T::TYPE, group).await
  }

  /// Records after `offset`, at most one batch, decoded.
  ///
  /// For readers keeping their own position in the log instead of
  /// subscribing.
  pub async fn read_after(
    &self,
    offset: i64,
  ) -> Result<Vec<(i64, Result<T, MalformedMessage>)>, QueueError> {
    let records = self
      .backend
      .read_after(T::TYPE, offset, self.config.batch_size)
      .await?;

    Ok(
      records
        .iter()
        .map(|record| (record.offset, decode::<T>(record)))
        .collect(),
    )
  }

  /// Consume the log as a member of `group`.
  ///
  /// Every record is handed to one member of the group and acknowledged
  /// once `handler` returned. A record whose member died before the
  /// acknowledgement is handed out again after the visibility timeout.
  pub fn receive<F, Fut>(&self, group: impl Into<String>, handler: F) -> Subscription
  where
    F: Fn(Result<T, MalformedMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let group = group.into();
    let queue = self.clone();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
      queue.consume_group(group, handler, token).await;
    });

    Subscription { cancel, handle }
  }

  /// Read every record of the log, independently of any other subscriber.
  pub fn broadcast<F, Fut>(&self, start: StartAt, handler: F) -> Subscription
  where
    F: Fn(Result<T, MalformedMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let queue = self.clone();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
      queue.consume_broadcast(start, handler, token).await;
    });

    Subscription { cancel, handle }
  }

  #[instrument(name = "queue_consumer", skip(self, handler, cancel), fields(queue = %T::TYPE))]
  async fn consume_group<F, Fut>(self, group: String, handler: F, cancel: CancellationToken)
  where
    F: Fn(Result<T, MalformedMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    loop {
      let claimed = tokio::select! {
        _ = cancel.cancelled() => break,
        claimed = self.backend.claim(
          T::TYPE,
          &group,
          self.config.batch_size,
          self.config.visibility_timeout(),
        ) => claimed,
      };

      let claimed = match claimed {
        Ok(claimed) => claimed,
        Err(e) => {
          error!(error = %e, "queue_claim_failed");
          self.idle(&cancel).await;
          continue;
        }
      };

      if claimed.is_empty() {
        self.idle(&cancel).await;
        continue;
      }

      for claim in claimed {
        handler(decode::<T>(&claim.record)).await;

        if let Err(e) = self
          .backend
          .ack(&group, claim.record.offset, &claim.token)
          .await
        {
          warn!(offset = claim.record.offset, error = %e, "queue_ack_failed");
        }
      }
    }
  }

  #[instrument(name = "queue_broadcast", skip(self, handler, cancel), fields(queue = %T::TYPE))]
  async fn consume_broadcast<F, Fut>(self, start: StartAt, handler: F, cancel: CancellationToken)
  where
    F: Fn(Result<T, MalformedMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut offset = match start {
      StartAt::Earliest => 0,
      StartAt::Latest => match self.backend.max_offset(T::TYPE).await {
        Ok(offset) => offset,
        Err(e) => {
          error!(error = %e, "queue_offset_failed");
          0
        }
      },
    };

    loop {
      let records = tokio::select! {
        _ = cancel.cancelled() => break,
        records = self.backend.read_after(T::TYPE, offset, self.config.batch_size) => records,
      };

      let records = match records {
        Ok(records) => records,
        Err(e) => {
          error!(error = %e, "queue_read_failed");
          self.idle(&cancel).await;
          continue;
        }
      };

      if records.is_empty() {
        self.idle(&cancel).await;
        continue;
      }

      for record in records {
        offset = record.offset;
        handler(decode::<T>(&record)).await;
      }
    }
  }

  async fn idle(&self, cancel: &CancellationToken) {
    tokio::select! {
      _ = cancel.cancelled() => {}
      _ = self.backend.wait(self.config.idle_delay()) => {}
    }
  }
}

fn decode<T: QueueMessage>(record: &Record) -> Result<T, MalformedMessage> {
  serde_json::from_str(&record.payload).map_err(|e| {
    let malformed = MalformedMessage {
      queue: T::TYPE,
      offset: record.offset,
      key: record.key.clone(),
      payload: record.payload.clone(),
      error: e.to_string(),
    };
    error!(
      queue = %T::TYPE,
      offset = record.offset,
      key = %record.key,
      error = %malformed.error,
      "malformed_message"
    );
    malformed
  })
}
