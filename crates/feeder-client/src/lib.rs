//! # Feeder Client
//!
//! The outbound half of the hub: subscribes to other hubs on a user's
//! behalf, accepts their verification and content callbacks, keeps leases
//! renewed, and relays incoming content to user-supplied callback URLs.
//! Topics without a discoverable hub fall back to the polling engine.

pub mod callbacks;
pub mod client;
pub mod relay;
pub mod renew;

pub use client::{CallbackOutcome, ExternalClient, SubscribeOutcome};
pub use relay::RelayRunner;
pub use renew::RenewRunner;
