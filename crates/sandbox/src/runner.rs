use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// External filesystem-containment tool (`<runner> -i -r <root> -- <cmd...>`).
///
/// The runner confines the wrapped command's writes under `root`; resource
/// ceilings are applied by the [`SandboxBackend`](crate::SandboxBackend)
/// that spawns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRunner {
    binary: PathBuf,
}

impl SandboxRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn command<I, S>(&self, root: &Path, argv: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i").arg("-r").arg(root).arg("--").args(argv);
        cmd
    }
}
