//! Shared core of the inference Dispatcher: the framing codec, the
//! per-Worker connection pool, the Model/Capability Registry, the Worker
//! Client and Worker supervisor, plus the ambient configuration and tracing
//! setup used by every binary built on top of this crate.

pub mod capability;
pub mod codec;
pub mod config;
pub mod pool;
pub mod registry;
pub mod tracing;
pub mod worker;
