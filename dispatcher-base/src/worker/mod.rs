pub mod client;
pub mod supervisor;

pub use client::{ClientError, WorkerClient};
pub use supervisor::{Supervisor, SupervisorError, WorkerState};
