//! # Feeder Server
//!
//! Ties the engines together: the axum HTTP adapter, the queue worker
//! dispatch loop, the periodic scheduler, and the admin read API.

pub mod admin;
pub mod error;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use routes::build_router;
pub use state::AppState;
