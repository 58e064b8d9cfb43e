//! Sandboxed, resource-bounded execution of external tools.
//!
//! Unix only: ceilings are `setrlimit` values and termination targets the
//! child's process group.

#![cfg(unix)]

pub mod backend;
pub mod runner;
pub mod supervisor;

pub use backend::unix::RlimitSandbox;
pub use backend::SandboxBackend;
pub use runner::SandboxRunner;
pub use supervisor::{OutputCapture, ProcessSupervisor, SupervisedRun};
