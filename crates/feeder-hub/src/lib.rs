//! # Feeder Hub
//!
//! The WebSub hub protocol engine: accepts subscription and publish
//! requests, drives asynchronous challenge verification against subscriber
//! callbacks, and fans content out to verified subscribers through the
//! durable queue.

pub mod distribute;
pub mod engine;
pub mod maintenance;
pub mod verify;

pub use distribute::DistributeRunner;
pub use engine::{HubEngine, SubscriptionOutcome, SubscriptionRequest};
pub use verify::VerifyRunner;
