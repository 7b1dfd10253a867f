//! HostDeck - remote session & channel multiplexer
//!
//! One SSH transport per configured host, fanned out into terminal sessions,
//! SFTP requests, one-shot commands and metrics polls. Built on russh and
//! tokio. The UI layer drives everything through [`commands::AppState`] and
//! receives terminal bytes and metrics snapshots from the [`events`]
//! dispatcher.

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod mux;
pub mod process;
pub mod sftp;
pub mod ssh;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use commands::AppState;
pub use error::CoreError;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber (`RUST_LOG` overrides the `info` default).
///
/// Calling it again once a subscriber is installed does nothing.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
