//! Typed configuration for the `dispatcher` binary: inference-RPC and
//! management-RPC bind addresses, pool/framing/supervisor tuning knobs, and
//! the optional Directory base URL that enables delegation.

use dispatcher_base::config::{ConfigLoader, HasConfigExamples};
use dispatcher_base::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpawnConfig {
    /// Opaque id this worker will use when it registers models with the
    /// Management RPC; also what the supervisor's backstop
    /// `unregister_worker` call names on crash.
    pub worker_id: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Socket path the supervisor tells the worker to bind, via
    /// [`dispatcher_base::worker::supervisor::ENV_SOCKET_PATH`].
    pub socket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections_per_worker: usize,
    pub max_frame_bytes: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_worker: 16,
            max_frame_bytes: dispatcher_base::codec::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub readiness_timeout_seconds: u64,
    pub graceful_stop_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_seconds: 10,
            graceful_stop_seconds: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    pub fn graceful_stop(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DelegationConfig {
    /// Base URL of the Directory, e.g. `http://directory:9500`. Delegation
    /// is disabled entirely when this is absent.
    pub directory_base_url: Option<String>,
    /// This Dispatcher's own replica id and externally reachable endpoint,
    /// announced to the Directory so other Dispatchers can delegate back.
    pub replica_id: Option<String>,
    pub advertised_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub tracing: TracingConfig,
    pub inference_host: String,
    pub inference_port: u16,
    pub management_host: String,
    pub management_port: u16,
    pub pool: PoolConfig,
    pub supervisor: SupervisorConfig,
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub workers: Vec<WorkerSpawnConfig>,
}

impl DispatcherConfig {
    pub fn inference_bind_address(&self) -> String {
        format!("{}:{}", self.inference_host, self.inference_port)
    }

    pub fn management_bind_address(&self) -> String {
        format!("{}:{}", self.management_host, self.management_port)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev(),
            inference_host: "0.0.0.0".to_string(),
            inference_port: 9000,
            management_host: "127.0.0.1".to_string(),
            management_port: 9001,
            pool: PoolConfig::default(),
            supervisor: SupervisorConfig::default(),
            delegation: DelegationConfig::default(),
            workers: Vec::new(),
        }
    }
}

impl HasConfigExamples for DispatcherConfig {
    fn label() -> &'static str {
        "dispatcher"
    }
}

pub fn make_config_loader() -> ConfigLoader<DispatcherConfig> {
    ConfigLoader::new("config/dispatcher.toml", "DISPATCHER")
}
