use std::io;
use tokio::process::{Child, Command};

/// Applies OS-level ceilings to a command and spawns it.
pub trait SandboxBackend: Send + Sync {
    fn set_cpu_limit(&mut self, secs: u64);
    fn set_memory_limit(&mut self, bytes: u64);

    /// Spawn `cmd` with the configured ceilings. The child leads its own
    /// process group so the whole tree can be signalled at once.
    fn spawn(&self, cmd: Command) -> io::Result<Child>;
}

#[cfg(unix)]
pub mod unix;
