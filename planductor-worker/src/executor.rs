//! Task Executor: runs the planner through the Sandbox Runner under resource
//! ceilings and a wall-clock cap, then lists the result files it produced.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use planductor_common::{snippet, TaskSpec};
use planductor_sandbox::{ProcessSupervisor, RlimitSandbox, SandboxBackend, SandboxRunner};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::ExecutorSettings;
use crate::dependencies::ResolvedTask;
use crate::discovery::{discover_results, ResultFile};

const LOG_SNIPPET_LIMIT: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to prepare sandbox under {}: {source}", dir.display())]
    Sandbox {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start sandbox runner {}: {source}", runner.display())]
    Spawn {
        runner: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sandbox runner failed with {status}")]
    NonZeroExit { status: String, output: String },
    #[error("planner exceeded its wall-clock cap of {}s", cap.as_secs())]
    TimedOut { cap: Duration, output: String },
    #[error("failed to list results in {}: {source}", dir.display())]
    Discovery {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A finished planner run. The sandbox directory lives as long as this does.
#[derive(Debug)]
pub struct Execution {
    pub sandbox: TempDir,
    pub output: String,
    pub elapsed: Duration,
    pub results: Vec<ResultFile>,
}

impl Execution {
    pub fn cleanup(self) {
        let path = self.sandbox.path().to_path_buf();
        if let Err(err) = self.sandbox.close() {
            warn!(dir = %path.display(), "Failed to remove sandbox directory: {}", err);
        }
    }
}

pub struct TaskExecutor {
    runner: SandboxRunner,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            runner: SandboxRunner::new(&settings.sandbox_runner),
            settings,
        }
    }

    /// Ceilings for one task: address space from config, CPU time equal to
    /// the task's budget.
    pub fn limits_for(&self, task: &TaskSpec) -> RlimitSandbox {
        let mut limits = RlimitSandbox::new();
        limits.set_memory_limit(self.settings.address_space_kb.saturating_mul(1024));
        limits.set_cpu_limit(task.duration_secs);
        limits
    }

    pub fn wall_clock_for(&self, task: &TaskSpec) -> Duration {
        Duration::from_secs(
            task.duration_secs
                .saturating_add(self.settings.wall_clock_slack_secs),
        )
    }

    /// `<runner> -i -r <sandbox> -- <planner> <domain> <problem> <result_path>`,
    /// run from the planner's own directory.
    pub fn command_for(&self, sandbox: &Path, resolved: &ResolvedTask) -> Command {
        let mut cmd = self.runner.command(
            sandbox,
            [
                resolved.planner.as_os_str(),
                resolved.domain.as_os_str(),
                resolved.problem.as_os_str(),
                OsStr::new(&self.settings.result_path),
            ],
        );
        cmd.current_dir(resolved.planner_dir());
        cmd
    }

    /// Where result files appear on the host: the result path re-rooted
    /// under the sandbox directory.
    pub fn result_location(&self, sandbox: &Path) -> (PathBuf, String) {
        let inside = Path::new(self.settings.result_path.trim_start_matches('/'));
        let basename = inside
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = match inside.parent() {
            Some(parent) => sandbox.join(parent),
            None => sandbox.to_path_buf(),
        };
        (dir, basename)
    }

    pub async fn execute(
        &self,
        task: &TaskSpec,
        resolved: &ResolvedTask,
    ) -> Result<Execution, ExecutionError> {
        let work_root = &self.settings.work_root;
        let sandbox_error = |source| ExecutionError::Sandbox {
            dir: work_root.clone(),
            source,
        };
        tokio::fs::create_dir_all(work_root)
            .await
            .map_err(sandbox_error)?;
        let sandbox = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(work_root)
            .map_err(sandbox_error)?;

        let limits = self.limits_for(task);
        let supervisor = ProcessSupervisor::new(self.wall_clock_for(task))
            .with_kill_grace(self.settings.kill_grace())
            .with_output_limit(self.settings.output_limit_bytes);

        info!(
            task_id = %task.name,
            sandbox = %sandbox.path().display(),
            cpu_secs = ?limits.cpu_limit_secs(),
            address_space_bytes = ?limits.memory_limit_bytes(),
            "Running planner"
        );
        let run = supervisor
            .run(&limits, self.command_for(sandbox.path(), resolved))
            .await
            .map_err(|source| ExecutionError::Spawn {
                runner: self.runner.binary().to_path_buf(),
                source,
            })?;

        let output = combine_output(&run.stdout, &run.stderr);
        info!(
            task_id = %task.name,
            exit = %run.describe_exit(),
            elapsed_secs = run.elapsed.as_secs(),
            budget_secs = task.duration_secs,
            "Sandbox runner exited"
        );

        if run.timed_out {
            return Err(ExecutionError::TimedOut {
                cap: supervisor.wall_clock(),
                output,
            });
        }
        if !run.success() {
            let excerpt = planductor_common::tail(&output, LOG_SNIPPET_LIMIT);
            error!(
                task_id = %task.name,
                exit_code = ?run.exit_code(),
                signal = ?run.signal(),
                output = %snippet(excerpt, LOG_SNIPPET_LIMIT),
                "Planner run failed"
            );
            return Err(ExecutionError::NonZeroExit {
                status: run.describe_exit(),
                output,
            });
        }

        let (dir, basename) = self.result_location(sandbox.path());
        let results = discover_results(&dir, &basename)
            .map_err(|source| ExecutionError::Discovery { dir, source })?;
        info!(task_id = %task.name, results = results.len(), "Result files discovered");

        Ok(Execution {
            sandbox,
            output,
            elapsed: run.elapsed,
            results,
        })
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        return stdout.to_string();
    }
    if stdout.is_empty() {
        return stderr.to_string();
    }
    let mut output = String::with_capacity(stdout.len() + stderr.len() + 1);
    output.push_str(stdout);
    if !stdout.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(stderr);
    output
}
