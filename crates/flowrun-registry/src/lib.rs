//! Flowrun Registry
//!
//! Bookkeeping of the live workers. Every worker registers a
//! [`WorkerInstance`](flowrun_model::WorkerInstance), heartbeats it, and
//! leases the task runs it is running. The [`Registry`] keeps each partition
//! owned by a single instance of a worker group and, when an instance stops
//! heartbeating, re-emits the work it leased so another worker picks it up.

mod config;
mod error;
mod memory;
mod partitions;
mod registry;
mod repository;
mod sqlite;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use memory::MemoryInstanceRepository;
pub use partitions::{assign_partitions, redistribute_partitions, remove_evicted_partitions};
pub use registry::Registry;
pub use repository::InstanceRepository;
pub use sqlite::SqliteInstanceRepository;
