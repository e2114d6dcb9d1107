//! Typed configuration for the `directory` binary, loaded the same way as
//! every other binary in this workspace: [`dispatcher_base::config::ConfigLoader`]
//! layering a TOML file under environment overrides, with code defaults for
//! everything.

use dispatcher_base::config::{ConfigLoader, HasConfigExamples};
use dispatcher_base::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub tracing: TracingConfig,
    pub http_host: String,
    pub http_port: u16,
    /// How often the control stream emits a keep-alive event while a
    /// registration remains open.
    pub keep_alive_interval_seconds: u64,
}

impl DirectoryConfig {
    pub fn http_bind_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_seconds)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev(),
            http_host: "0.0.0.0".to_string(),
            http_port: 9500,
            keep_alive_interval_seconds: 15,
        }
    }
}

impl HasConfigExamples for DirectoryConfig {
    fn label() -> &'static str {
        "directory"
    }
}

pub fn make_config_loader() -> ConfigLoader<DirectoryConfig> {
    ConfigLoader::new("config/directory.toml", "DIRECTORY")
}
