//! # Feeder Core
//!
//! Shared foundation for SuperDuperFeeder: the unified error type, the
//! application configuration, the persisted domain entities and the queue
//! message union that ties the hub, polling and external-client engines
//! together.

pub mod config;
pub mod error;
pub mod message;
pub mod model;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use message::{TaskMessage, VerificationMode};

/// User-Agent header value sent on every outbound request.
///
/// The `SuperDuperFeeder/<version>` shape is part of the wire contract and
/// must not change independently of the crate version.
pub fn user_agent() -> String {
    format!("SuperDuperFeeder/{}", env!("CARGO_PKG_VERSION"))
}

/// Header used to tell a user callback which topic a relayed body belongs to.
pub const TOPIC_HEADER: &str = "X-SuperDuperFeeder-Topic";
