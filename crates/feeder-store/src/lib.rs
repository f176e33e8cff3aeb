//! # Feeder Store
//!
//! Typed key/value persistence with secondary indexes, compare-and-set
//! updates, and a durable at-least-once task queue that enqueues atomically
//! with row mutations.
//!
//! Two interchangeable backends implement the same contract: a
//! Postgres-backed one for production and an in-memory one for development
//! and tests.

pub mod backend;
pub mod key;
pub mod memory;
pub mod migration;
pub mod postgres;
pub mod queue;
pub mod store;

pub use backend::{AtomicWrite, Enqueue, KvBackend, KvOp, QueueMessage, VersionedValue};
pub use key::{keys, KvKey};
pub use memory::MemoryBackend;
pub use postgres::PgBackend;
pub use queue::TaskQueue;
pub use store::Store;
