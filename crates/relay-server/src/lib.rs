//! # relay-server
//!
//! Real-time chat relay: every message a client sends over `/ws` is fanned
//! out to every other connected client.
//!
//! The binary (`relay`) loads a [`config::Config`] and calls
//! [`handlers::run_server`]. Tests and embedders can build the same app with
//! [`handlers::AppState`] and [`handlers::serve`] on a listener of their own.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_app, run_server, serve, AppState};
