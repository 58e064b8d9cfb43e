//! Planductor worker.
//!
//! Pulls one task at a time from `planductord`, runs the planner inside the
//! Sandbox Runner, validates every plan it leaves behind and reports back.

#![cfg(unix)]

pub mod config;
pub mod dependencies;
pub mod discovery;
pub mod executor;
pub mod session;
pub mod transport;
pub mod validator;

pub use config::{load_settings, IdlePolicy, WorkerSettings};
pub use session::{CycleOutcome, SessionState, WorkerSession};
pub use transport::{Transport, TransportError};
