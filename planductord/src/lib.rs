//! Planductor dispatcher.
//!
//! Holds the task registry and serves workers over newline-delimited JSON,
//! optionally inside TLS.

pub mod config;
pub mod dispatcher;
pub mod registry;

pub use config::{load_config, seed_registry, DispatcherConfig, ListenSettings, TlsSettings};
pub use dispatcher::{handle_message, Dispatcher};
pub use registry::{AssignmentState, RegistryError, RegistrySummary, TaskRecord, TaskRegistry};
