//! Tracing subscriber bootstrap for applications embedding the mesh.
//!
//! Libraries in this workspace only emit `tracing` events; installing a
//! subscriber is left to the embedding application, which can call
//! [`init_tracing`] once at startup.

use crate::config::ObservabilityConfig;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Build the `EnvFilter`: `RUST_LOG` wins, otherwise the configured level.
fn build_filter(config: &ObservabilityConfig) -> Result<EnvFilter, ObservabilityError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| ObservabilityError::InvalidFilter(e.to_string())),
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns `InvalidFilter` for an unparseable log directive and
/// `AlreadyInstalled` if a global subscriber is already set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let filter = build_filter(config)?;

    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| ObservabilityError::AlreadyInstalled(e.to_string()))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| ObservabilityError::AlreadyInstalled(e.to_string()))
    }
}
