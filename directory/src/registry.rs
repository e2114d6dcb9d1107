//! The Directory's in-memory map: `replica_id -> (endpoint, capabilities)`.
//!
//! An entry's lifetime is coupled to its control stream by the HTTP layer,
//! not by this module — [`DirectoryRegistry`] only holds whatever is
//! currently registered and answers lookups against it. Matching reuses the
//! unordered capability subset rule from [`dispatcher_base::capability`], the
//! same rule the Registry's simplified `(name, version)` variant implements
//! as a two-key special case.
//!
//! Each registration is stamped with a monotonically increasing `token`.
//! When a stream closes it removes its entry only if the token still
//! matches what's currently stored — otherwise a superseding re-register
//! already replaced it, and the stale stream's closure must not evict the
//! newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dispatcher_base::capability::{matches, Capability};
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub replica_id: String,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
}

struct Stamped {
    entry: Entry,
    token: u64,
}

struct Inner {
    entries: HashMap<String, Stamped>,
}

/// Thread-safe, cheaply cloneable directory of Dispatcher replicas.
#[derive(Clone)]
pub struct DirectoryRegistry {
    inner: std::sync::Arc<Mutex<Inner>>,
    next_token: std::sync::Arc<AtomicU64>,
}

impl Default for DirectoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
            })),
            next_token: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    /// Inserts or overwrites the entry for `replica_id`. A second register
    /// for the same `replica_id` replaces the prior entry wholesale.
    /// Returns a token identifying this specific registration, to be passed
    /// to [`DirectoryRegistry::remove_if_current`] when its stream closes.
    pub fn register(&self, entry: Entry) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .insert(entry.replica_id.clone(), Stamped { entry, token });
        token
    }

    /// Removes the entry for `replica_id` iff it is still the one stamped
    /// with `token` — a no-op if a later registration already replaced it.
    /// Called when a control stream closes, normally or by error.
    pub fn remove_if_current(&self, replica_id: &str, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let std::collections::hash_map::Entry::Occupied(slot) =
            inner.entries.entry(replica_id.to_string())
        {
            if slot.get().token == token {
                slot.remove();
            }
        }
    }

    /// Returns one entry whose offer is a superset of `query`, excluding
    /// `exclude_replica_id` if given, chosen by uniform random selection
    /// among all matches. `None` if no entry matches.
    pub fn route(&self, query: &Capability, exclude_replica_id: Option<&str>) -> Option<Entry> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&Entry> = inner
            .entries
            .values()
            .map(|stamped| &stamped.entry)
            .filter(|entry| exclude_replica_id != Some(entry.replica_id.as_str()))
            .filter(|entry| entry.capabilities.iter().any(|offer| matches(query, offer)))
            .collect();

        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        let index = rand::rng().random_range(0..candidates.len());
        Some(candidates[index].clone())
    }

    /// Enumerates the current entries, sorted by `replica_id` for a stable
    /// snapshot.
    pub fn snapshot(&self) -> Vec<Entry> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<Entry> = inner.entries.values().map(|s| s.entry.clone()).collect();
        entries.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        entries
    }
}
