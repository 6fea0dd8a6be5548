//! Flowrun Queue
//!
//! Append-only, offset ordered message queues connecting the executor and
//! the workers. Every message is kept in one log per [`QueueType`] and can be
//! consumed two ways:
//!
//! - **competing consumers**: the members of a consumer group share the
//!   messages, each one is handed to a single member and acknowledged once
//!   its handler returned. A claim that isn't acknowledged within the
//!   visibility timeout is handed out again.
//! - **broadcast**: every subscriber reads every message from its own
//!   offset, starting at the beginning or at the end of the log.
//!
//! Delivery is at least once: consumers are expected to be idempotent.
//!
//! Two [`QueueBackend`]s are provided, [`MemoryQueue`] for a single process
//! and [`SqliteQueue`] for durable, multi-process setups. Typed access goes
//! through [`Queue`].

mod backend;
mod config;
mod error;
mod memory;
mod message;
mod queue;
mod queues;
mod sqlite;

pub use backend::{Claimed, QueueBackend, Record};
pub use config::QueueConfig;
pub use error::{MalformedMessage, QueueError};
pub use memory::MemoryQueue;
pub use message::{QueueMessage, QueueType};
pub use queue::{Queue, StartAt, Subscription};
pub use queues::Queues;
pub use sqlite::SqliteQueue;
