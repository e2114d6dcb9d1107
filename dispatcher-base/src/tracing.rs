//! Global `tracing` subscriber setup shared by every binary in this
//! workspace: an `EnvFilter` layered with either a human-readable or a
//! structured JSON `fmt` layer, selected by config.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub format: TracingFormat,
    /// Default `EnvFilter` directive used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl TracingConfig {
    /// A human-friendly default suitable for running a binary on a laptop.
    pub fn local_dev() -> Self {
        Self {
            format: TracingFormat::Pretty,
            default_filter: "info".to_string(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev()
    }
}

/// Installs the global `tracing` subscriber. Must be called once, as early
/// as possible in `main`.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));

    let registry = Registry::default().with(filter);

    match config.format {
        TracingFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .try_init()
                .ok();
        }
        TracingFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_target(true))
                .try_init()
                .ok();
        }
    }
}
