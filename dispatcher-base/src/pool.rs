//! Per-Worker pool of local Unix-domain-socket connections.
//!
//! One [`Pool`] is shared by every caller of a given Dispatcher process. It
//! lazily creates a per-endpoint [`PoolEntry`] on first `acquire` and never
//! removes it implicitly — callers drop the whole pool (or call
//! [`Pool::shutdown`]) when an endpoint is deregistered.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool for {endpoint} is exhausted ({max_connections} in use)")]
    Exhausted {
        endpoint: String,
        max_connections: usize,
    },
    #[error("failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("endpoint {endpoint} is not a local socket address (expected unix://<path>)")]
    NotALocalSocket { endpoint: String },
    #[error("connection pool for {endpoint} has been shut down")]
    Closed { endpoint: String },
}

/// Strips the `unix://` scheme off an endpoint string, the only connection
/// form the pool establishes itself. Remote `host:port` endpoints are
/// forwarded to over the network by other collaborators; the pool is
/// Worker-IPC-specific.
fn socket_path(endpoint: &str) -> Option<&str> {
    endpoint.strip_prefix("unix://")
}

struct PoolEntry {
    idle: Vec<UnixStream>,
    in_use: usize,
    max_connections: usize,
    closed: bool,
}

impl PoolEntry {
    fn new(max_connections: usize) -> Self {
        Self {
            idle: Vec::new(),
            in_use: 0,
            max_connections,
            closed: false,
        }
    }

    fn invariant_holds(&self) -> bool {
        self.in_use + self.idle.len() <= self.max_connections
    }
}

/// A pooled connection. Callers MUST return it via [`Pool::release`]; a
/// `Connection` dropped without being released still decrements `in_use` (as
/// an unhealthy release) so the slot isn't lost, via the `entry` handle it
/// carries back to its own `PoolEntry`.
pub struct Connection {
    endpoint: String,
    entry: std::sync::Arc<Mutex<PoolEntry>>,
    stream: Option<UnixStream>,
    released: bool,
}

impl Connection {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        self.stream.as_mut().expect("connection stream taken twice")
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                endpoint = %self.endpoint,
                "connection dropped without being released to the pool; treating as unhealthy"
            );
            let mut guard = self.entry.lock().unwrap();
            guard.in_use -= 1;
            debug_assert!(guard.invariant_holds());
        }
    }
}

#[derive(Clone)]
pub struct Pool {
    entries: std::sync::Arc<Mutex<HashMap<String, std::sync::Arc<Mutex<PoolEntry>>>>>,
    default_max_connections: usize,
}

impl Pool {
    pub fn new(default_max_connections: usize) -> Self {
        Self {
            entries: std::sync::Arc::new(Mutex::new(HashMap::new())),
            default_max_connections,
        }
    }

    fn entry_for(&self, endpoint: &str) -> std::sync::Arc<Mutex<PoolEntry>> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(Mutex::new(PoolEntry::new(self.default_max_connections)))
            })
            .clone()
    }

    /// Acquires a connection for `endpoint`. Reuses an idle connection if
    /// one exists; otherwise connects a new one provided the pool is below
    /// `max_connections`; otherwise reports exhaustion. Never waits.
    pub async fn acquire(&self, endpoint: &str) -> Result<Connection, PoolError> {
        let path = socket_path(endpoint).ok_or_else(|| PoolError::NotALocalSocket {
            endpoint: endpoint.to_string(),
        })?;

        let entry = self.entry_for(endpoint);

        // Try to reuse an idle connection, or reserve a slot to connect a
        // new one, without holding the lock across the (async) connect.
        let reserved_new = {
            let mut guard = entry.lock().unwrap();
            if guard.closed {
                return Err(PoolError::Closed {
                    endpoint: endpoint.to_string(),
                });
            }
            if let Some(stream) = guard.idle.pop() {
                guard.in_use += 1;
                debug_assert!(guard.invariant_holds());
                return Ok(Connection {
                    endpoint: endpoint.to_string(),
                    entry: entry.clone(),
                    stream: Some(stream),
                    released: false,
                });
            }
            if guard.in_use < guard.max_connections {
                guard.in_use += 1;
                true
            } else {
                false
            }
        };

        if !reserved_new {
            let max_connections = entry.lock().unwrap().max_connections;
            return Err(PoolError::Exhausted {
                endpoint: endpoint.to_string(),
                max_connections,
            });
        }

        match UnixStream::connect(path).await {
            Ok(stream) => {
                debug!(endpoint, "connected new pooled connection");
                Ok(Connection {
                    endpoint: endpoint.to_string(),
                    entry: entry.clone(),
                    stream: Some(stream),
                    released: false,
                })
            }
            Err(source) => {
                // Give back the slot we reserved; this was never an in-use
                // connection.
                entry.lock().unwrap().in_use -= 1;
                Err(PoolError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
        }
    }

    /// Returns a connection to the pool. `healthy` connections go back on
    /// the idle list; unhealthy ones are dropped. Decrements `in_use`
    /// exactly once regardless of health.
    pub fn release(&self, mut conn: Connection, healthy: bool) {
        conn.released = true;
        let mut guard = conn.entry.lock().unwrap();
        guard.in_use -= 1;
        if healthy && !guard.closed {
            if let Some(stream) = conn.stream.take() {
                guard.idle.push(stream);
            }
        }
        debug_assert!(guard.invariant_holds());
    }

    /// Closes every connection for `endpoint`, idle or in use, and rejects
    /// further `acquire` calls against it.
    pub fn shutdown_endpoint(&self, endpoint: &str) {
        let entry = self.entry_for(endpoint);
        let mut guard = entry.lock().unwrap();
        guard.idle.clear();
        guard.closed = true;
    }

    /// Closes every endpoint's connections and rejects further `acquire`
    /// calls across the whole pool.
    pub fn shutdown(&self) {
        let entries = self.entries.lock().unwrap();
        for entry in entries.values() {
            let mut guard = entry.lock().unwrap();
            guard.idle.clear();
            guard.closed = true;
        }
    }

    #[cfg(test)]
    fn counts(&self, endpoint: &str) -> (usize, usize) {
        let entry = self.entry_for(endpoint);
        let guard = entry.lock().unwrap();
        (guard.in_use, guard.idle.len())
    }
}
