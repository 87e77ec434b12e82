pub mod cell;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gates;
pub mod ports;
pub mod report;
pub mod server;
pub mod taskdb;
pub mod worktree;

pub use error::{CoreError, Result};

/// Install the global tracing subscriber for binaries embedding this
/// library. `RUST_LOG` controls filtering; without it, everything at
/// `info` and above is emitted.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("tracing subscriber installed");
}
