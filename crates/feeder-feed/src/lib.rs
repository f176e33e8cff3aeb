//! # Feeder Feed
//!
//! The upstream-facing layer: HTTP fetching with conditional-GET support,
//! RSS/Atom parsing into a normalized shape, and WebSub hub/feed discovery.

pub mod discovery;
pub mod fetch;
pub mod parser;

pub use discovery::{Discovery, DiscoveryResult};
pub use fetch::{build_http_client, ConditionalHeaders, FetchClient, FetchedResponse};
pub use parser::{parse_feed, ParsedEntry, ParsedFeed};
