//! The inference routing front-end: implements the KServe v2 inference RPC
//! surface and the Worker-facing management RPC surface on top of
//! `dispatcher_base`'s Registry, connection pool and Worker Client, plus
//! the Worker supervisor and optional Directory delegation.

pub mod config;
pub mod delegation;
pub mod error;
pub mod service;
pub mod supervisor;
