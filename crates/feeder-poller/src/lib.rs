//! # Feeder Poller
//!
//! The fallback path for feeds without a WebSub hub: conditional-GET
//! fetching on a per-feed cadence, change detection against stored items,
//! and synthesized content notifications into the hub engine.

pub mod poller;

pub use poller::{enqueue_due_polls, PollOutcome, PollRunner};
