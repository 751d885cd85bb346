//! Gateway server: client identity, routing and the server loop

pub mod client;
mod router;
mod server;

pub use client::client_identifier;
pub use router::{AppState, CACHE_CONTROL_VALUE, CachedPayload, create_router};
pub use server::{Gateway, spawn_sweepers};
pub(crate) use server::shutdown_signal;
