use sbuffer::SBufferError;
use std::collections::TryReserveError;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error};

pub mod analytics;
pub mod config;
pub mod endpoint;
pub mod event_log;
pub mod gateway;
pub mod multiplexer;
pub mod pacing;
pub mod shutdown;
pub mod storage;

pub use config::GatewayConfig;
pub use gateway::{Gateway, Summary};
pub use shutdown::{Shutdown, State, StopReason};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
    #[error("Shared buffer error: {0}")]
    Buffer(#[from] SBufferError),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
    #[error("Malformed sensor map entry at line {line}: {content:?}")]
    SensorMap { line: usize, content: String },
    #[error("Database unreachable after {0} attempts")]
    StoreUnavailable(u32),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Wall-clock seconds since the epoch, as carried in a reading's timestamp.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Runs a component loop on its own named thread. An error returned by the
/// loop is logged, printed and escalated into a fatal stop request so the
/// other components wind down.
pub fn spawn_component<F>(name: &str, shutdown: &Shutdown, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let shutdown = shutdown.clone();
    let component = name.to_string();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match body() {
            Ok(()) => debug!(component, "component exited"),
            Err(e) => {
                error!(component, error = %e, "component failed");
                eprintln!("FATAL ERROR in {}: {}", component, e);
                shutdown.request(StopReason::Fatal(format!("{}: {}", component, e)));
            }
        })?;
    Ok(handle)
}
