//! The in-memory Model/Capability Registry: a bidirectional index between a
//! `model_key` (`name`, or `name:version`) and the Worker endpoint that
//! serves it, plus a reverse index by `worker_id` for bulk eviction on
//! Worker death.
//!
//! All three indices (forward, reverse, endpoint-by-worker) are guarded by a
//! single mutex, matching the concurrency model's requirement that mutating
//! and read operations be serialized against each other. The Registry never
//! blocks on I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no worker registered for the requested model")]
pub struct NotFound;

fn model_key(model_name: &str, model_version: &str) -> String {
    if model_version.is_empty() {
        model_name.to_string()
    } else {
        format!("{model_name}:{model_version}")
    }
}

struct Inner {
    // model_key -> worker_endpoint
    forward: HashMap<String, String>,
    // worker_id -> set of model_keys it owns
    reverse: HashMap<String, HashSet<String>>,
    // worker_id -> worker_endpoint, kept only while the worker owns >=1 key
    endpoint_by_worker: HashMap<String, String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            endpoint_by_worker: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let reverse_keys: HashSet<&String> = self
            .reverse
            .values()
            .flat_map(|keys| keys.iter())
            .collect();
        let forward_keys: HashSet<&String> = self.forward.keys().collect();
        if reverse_keys != forward_keys {
            return false;
        }
        for worker_id in self.reverse.keys() {
            if !self.endpoint_by_worker.contains_key(worker_id) {
                return false;
            }
        }
        for worker_id in self.endpoint_by_worker.keys() {
            if !self.reverse.contains_key(worker_id) {
                return false;
            }
        }
        true
    }
}

/// Thread-safe bidirectional `(model_name, model_version)` ⇄ Worker
/// endpoint index. Cheaply cloneable; clones share the same underlying
/// state.
#[derive(Clone)]
pub struct Registry {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Upserts the forward entry for `(model_name, model_version)`, and
    /// records that `worker_id` now owns it. Last writer wins if another
    /// worker previously owned the same key — that worker's reverse set is
    /// updated to no longer list it, even if its endpoint happens to match
    /// the incoming one; ownership is keyed on `worker_id`, not endpoint.
    pub fn register(
        &self,
        model_name: &str,
        model_version: &str,
        worker_endpoint: &str,
        worker_id: &str,
    ) {
        let key = model_key(model_name, model_version);
        let mut inner = self.inner.lock().unwrap();

        // Ownership is keyed on worker_id, not endpoint: detach whoever
        // currently owns this key whenever it isn't the incoming worker_id,
        // even if they happen to share the same endpoint string.
        if let Some(previous_owner) = inner
            .reverse
            .iter()
            .find(|(id, keys)| id.as_str() != worker_id && keys.contains(&key))
            .map(|(id, _)| id.clone())
        {
            if let Some(keys) = inner.reverse.get_mut(&previous_owner) {
                keys.remove(&key);
                if keys.is_empty() {
                    inner.reverse.remove(&previous_owner);
                    inner.endpoint_by_worker.remove(&previous_owner);
                }
            }
        }

        inner.forward.insert(key.clone(), worker_endpoint.to_string());
        inner
            .reverse
            .entry(worker_id.to_string())
            .or_default()
            .insert(key.clone());
        inner
            .endpoint_by_worker
            .insert(worker_id.to_string(), worker_endpoint.to_string());

        info!(model_key = %key, worker_id, worker_endpoint, "registered model");
    }

    /// Looks up the endpoint serving `(model_name, model_version)`. If
    /// `model_version` is non-empty and not found, falls back to the
    /// version-less key for the same name. This two-step is the only
    /// fallback: no latest-version heuristic, no prefix match, no wildcard.
    pub fn lookup(&self, model_name: &str, model_version: &str) -> Result<String, NotFound> {
        let inner = self.inner.lock().unwrap();
        let key = model_key(model_name, model_version);
        if let Some(endpoint) = inner.forward.get(&key) {
            debug!(model_key = %key, "lookup hit");
            return Ok(endpoint.clone());
        }
        if !model_version.is_empty() {
            if let Some(endpoint) = inner.forward.get(model_name) {
                debug!(model_name, "lookup fell back to version-less entry");
                return Ok(endpoint.clone());
            }
        }
        Err(NotFound)
    }

    /// Removes the `(model_name, model_version)` entry if it is currently
    /// owned by `worker_id`. Returns whether an entry was removed.
    pub fn unregister_model(&self, model_name: &str, model_version: &str, worker_id: &str) -> bool {
        let key = model_key(model_name, model_version);
        let mut inner = self.inner.lock().unwrap();

        let owns_key = inner
            .reverse
            .get(worker_id)
            .is_some_and(|keys| keys.contains(&key));
        if !owns_key {
            return false;
        }

        inner.forward.remove(&key);
        if let Some(keys) = inner.reverse.get_mut(worker_id) {
            keys.remove(&key);
            if keys.is_empty() {
                inner.reverse.remove(worker_id);
                inner.endpoint_by_worker.remove(worker_id);
            }
        }

        info!(model_key = %key, worker_id, "unregistered model");
        true
    }

    /// Removes every `model_key` owned by `worker_id`, plus its reverse and
    /// endpoint records. Returns how many forward entries were dropped.
    pub fn unregister_worker(&self, worker_id: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Some(keys) = inner.reverse.remove(worker_id) else {
            return 0;
        };
        inner.endpoint_by_worker.remove(worker_id);
        for key in &keys {
            inner.forward.remove(key);
        }
        info!(worker_id, removed = keys.len(), "unregistered worker");
        keys.len()
    }

    pub fn list_models(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<String> = inner.forward.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn list_models_by_worker(&self, worker_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<String> = inner
            .reverse
            .get(worker_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_hit() {
        let registry = Registry::new();
        registry.register("add", "", "unix:///tmp/w0.sock", "w0");
        assert_eq!(registry.lookup("add", "").unwrap(), "unix:///tmp/w0.sock");
    }

    #[test]
    fn versioned_fallback_disabled_for_empty_version_query() {
        let registry = Registry::new();
        registry.register("classifier", "v1", "unix:///tmp/w1.sock", "w1");
        assert_eq!(registry.lookup("classifier", ""), Err(NotFound));
    }

    #[test]
    fn versioned_fallback_enabled_for_nonempty_version_query() {
        let registry = Registry::new();
        registry.register("classifier", "", "unix:///tmp/w1.sock", "w1");
        assert_eq!(
            registry.lookup("classifier", "v1").unwrap(),
            "unix:///tmp/w1.sock"
        );
    }

    #[test]
    fn lookup_of_absent_key_does_not_mutate() {
        let registry = Registry::new();
        assert_eq!(registry.lookup("missing", ""), Err(NotFound));
        assert!(registry.list_models().is_empty());
    }

    #[test]
    fn unregister_worker_removes_only_its_own_keys() {
        let registry = Registry::new();
        registry.register("a", "", "unix:///tmp/a.sock", "worker-a");
        registry.register("b", "", "unix:///tmp/b.sock", "worker-b");

        let removed = registry.unregister_worker("worker-a");
        assert_eq!(removed, 1);
        assert_eq!(registry.lookup("a", ""), Err(NotFound));
        assert_eq!(registry.lookup("b", "").unwrap(), "unix:///tmp/b.sock");
    }

    #[test]
    fn unregister_model_drops_worker_once_its_last_key_is_gone() {
        let registry = Registry::new();
        registry.register("a", "v1", "unix:///tmp/a.sock", "worker-a");
        registry.register("a", "v2", "unix:///tmp/a.sock", "worker-a");

        assert!(registry.unregister_model("a", "v1", "worker-a"));
        assert_eq!(registry.list_models_by_worker("worker-a"), vec!["a:v2"]);

        assert!(registry.unregister_model("a", "v2", "worker-a"));
        assert!(registry.list_models_by_worker("worker-a").is_empty());
    }

    #[test]
    fn unregister_model_owned_by_a_different_worker_is_a_no_op() {
        let registry = Registry::new();
        registry.register("a", "", "unix:///tmp/a.sock", "worker-a");
        assert!(!registry.unregister_model("a", "", "worker-b"));
        assert_eq!(registry.lookup("a", "").unwrap(), "unix:///tmp/a.sock");
    }

    #[test]
    fn last_writer_wins_on_conflicting_reregister() {
        let registry = Registry::new();
        registry.register("a", "", "unix:///tmp/1.sock", "worker-1");
        registry.register("a", "", "unix:///tmp/2.sock", "worker-2");

        assert_eq!(registry.lookup("a", "").unwrap(), "unix:///tmp/2.sock");
        assert!(registry.list_models_by_worker("worker-1").is_empty());
        assert_eq!(registry.list_models_by_worker("worker-2"), vec!["a"]);
    }

    #[test]
    fn reregister_with_the_same_endpoint_still_detaches_the_previous_owner() {
        let registry = Registry::new();
        registry.register("m", "", "unix://x", "worker-a");
        registry.register("m", "", "unix://x", "worker-b");

        assert!(registry.list_models_by_worker("worker-a").is_empty());
        assert_eq!(registry.list_models_by_worker("worker-b"), vec!["m"]);

        let removed = registry.unregister_worker("worker-a");
        assert_eq!(removed, 0);
        assert_eq!(registry.lookup("m", "").unwrap(), "unix://x");
        assert_eq!(registry.list_models_by_worker("worker-b"), vec!["m"]);
    }

    #[test]
    fn forward_and_reverse_indices_stay_consistent_under_interleaving() {
        let registry = Registry::new();
        registry.register("a", "", "unix:///tmp/a.sock", "w1");
        registry.register("b", "", "unix:///tmp/b.sock", "w1");
        registry.register("c", "", "unix:///tmp/c.sock", "w2");
        registry.unregister_model("a", "", "w1");
        registry.register("d", "", "unix:///tmp/d.sock", "w2");
        registry.unregister_worker("w2");

        let inner = registry.inner.lock().unwrap();
        assert!(inner.is_consistent());
    }
}
