//! Cinedex - a movie catalogue JSON API.
//!
//! The interesting part is the request pipeline every call travels through:
//!
//! 1. panic recovery (500 + `Connection: close`)
//! 2. request metrics and the per-request tracing span
//! 3. per-client token bucket rate limiting
//! 4. CORS for an exact-match list of trusted origins
//! 5. bearer token authentication, producing a [`core::RequestContext`]
//!
//! followed by a per-route access gate (authenticated, activated, or holding
//! a permission code) and the handler itself.
//!
//! Work that outlives a request, such as sending the welcome email, is handed
//! to [`utils::BackgroundTasks`]; [`server::serve`] waits for it on shutdown.
//!
//! # Architecture
//! Business rules live in `core`, the interfaces to storage and email in
//! `ports`, and the HTTP wiring plus in-memory implementations in `adapters`.
//!
//! # Quick Example
//! ```no_run
//! use cinedex::{config::ServerConfig, server};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg: ServerConfig = cinedex::config::load_config("config.toml").await?;
//! let exporter = cinedex::metrics::init_metrics()?;
//! server::run(cfg, Some(exporter)).await?;
//! # Ok(()) }
//! ```
pub mod config;
pub mod metrics;
pub mod ports;
pub mod server;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{AppState, LogMailer, MemoryStore},
    server::{build_router, serve},
    utils::{BackgroundTasks, GracefulShutdown},
};
