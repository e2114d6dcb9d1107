//! Wires the configured Worker processes to `dispatcher_base::worker::Supervisor`:
//! spawns each one, waits for its readiness signal with the configured
//! timeout, and watches for exit afterwards. Workers deregister themselves
//! from the Registry via the Management RPC before exiting cleanly; the
//! liveness watchdog here is the backstop described in §4.7 for the case
//! where a Worker dies without doing so.

use std::sync::Arc;
use std::time::Duration;

use dispatcher_base::registry::Registry;
use dispatcher_base::worker::{Supervisor, WorkerState};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::WorkerSpawnConfig;

/// The supervised Worker fleet for one Dispatcher process. Cheaply
/// cloneable: clones share the same underlying supervisors, so a liveness
/// watchdog can run on a clone in a background task while the original is
/// kept around to drive shutdown.
#[derive(Clone)]
pub struct ManagedWorkers {
    supervisors: Arc<Mutex<Vec<Supervisor>>>,
}

impl ManagedWorkers {
    /// Spawns every configured Worker and waits for each to signal
    /// readiness in turn. A Worker that fails to spawn or times out on
    /// readiness is logged and excluded from the fleet rather than aborting
    /// the others; callers that need all-or-nothing startup should check
    /// `len()` against `configs.len()`.
    pub async fn spawn_all(configs: &[WorkerSpawnConfig], readiness_timeout: Duration) -> Self {
        let mut supervisors = Vec::with_capacity(configs.len());

        for worker in configs {
            match Supervisor::spawn(
                &worker.program,
                &worker.args,
                worker.worker_id.clone(),
                worker.socket_path.clone(),
                std::collections::HashMap::new(),
            ) {
                Ok(mut supervisor) => match supervisor.wait_for_ready(readiness_timeout).await {
                    Ok(()) => {
                        info!(worker_id = %worker.worker_id, "worker ready");
                        supervisors.push(supervisor);
                    }
                    Err(err) => {
                        error!(worker_id = %worker.worker_id, %err, "worker failed to become ready");
                        supervisor.stop(Duration::from_secs(5)).await;
                    }
                },
                Err(err) => {
                    error!(worker_id = %worker.worker_id, %err, "failed to spawn worker");
                }
            }
        }

        Self {
            supervisors: Arc::new(Mutex::new(supervisors)),
        }
    }

    pub async fn len(&self) -> usize {
        self.supervisors.lock().await.len()
    }

    /// Runs forever, periodically checking every supervised Worker's
    /// liveness and evicting its Registry entries the moment it is
    /// observed dead. Intended to run in its own task, aborted (not
    /// awaited for a result) at shutdown.
    pub async fn watch_liveness(&self, registry: Registry, poll_interval: Duration) {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            let mut supervisors = self.supervisors.lock().await;
            for supervisor in supervisors.iter_mut() {
                if supervisor.state() == WorkerState::Dead {
                    continue;
                }
                if !supervisor.is_alive() {
                    let worker_id = supervisor.worker_id().to_string();
                    let removed = registry.unregister_worker(&worker_id);
                    warn!(
                        worker_id,
                        removed, "worker process exited; evicted its registry entries"
                    );
                }
            }
        }
    }

    /// Stops every supervised Worker, gracefully then forcefully, and
    /// removes their socket files.
    pub async fn stop_all(&self, graceful_timeout: Duration) {
        let mut supervisors = self.supervisors.lock().await;
        for supervisor in supervisors.iter_mut() {
            supervisor.stop(graceful_timeout).await;
        }
    }
}
