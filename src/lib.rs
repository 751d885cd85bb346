//! Sheet Gateway Library
//!
//! A small HTTP proxy in front of a spreadsheet API, plus an offline cache
//! controller for the web app that consumes it.
//!
//! # Features
//!
//! - **Proxy**: `GET /api/sheets` lists sheets or returns one sheet's values
//! - **Rate limiting**: sliding-window quota per client identity
//! - **Caching**: bounded TTL cache with FIFO eviction in front of the upstream
//! - **Offline cache controller**: service-worker style install, activate and
//!   per-class fetch strategies over versioned named stores
//! - **Edge host**: serves the web app through the controller

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod upstream;
pub mod worker;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
