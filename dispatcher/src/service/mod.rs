//! The two gRPC services the Dispatcher exposes: the client-facing
//! inference surface (§4.5) and the Worker-facing management surface
//! (§4.6), plus the shared readiness flag both the server startup sequence
//! and `ServerReady` consult.

pub mod dispatch;
pub mod management;

pub use dispatch::{DelegationContext, DispatchGrpcApi, ReadinessFlag};
pub use management::ManagementGrpcApi;
