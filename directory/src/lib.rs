//! The cluster-wide capability Directory: a process-global, out-of-band
//! service holding `{replica_id -> (endpoint, capabilities)}`, kept alive
//! through long-lived control streams opened by Dispatchers. See
//! [`registry`] for the matching rule and [`http`] for the HTTP surface.

pub mod config;
pub mod error;
pub mod http;
pub mod registry;
