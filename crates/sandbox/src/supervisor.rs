//! Deadline-aware child process supervision.
//!
//! The supervisor blocks on the child until it exits or a wall-clock cap
//! expires. On expiry the child's process group receives SIGTERM, then
//! SIGKILL if it has not gone away after the grace period.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::backend::SandboxBackend;

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Which end of a long output stream survives the size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCapture {
    /// Keep the last bytes; the interesting part of a log is its end.
    #[default]
    Tail,
    /// Keep the first bytes; for reports read by line position.
    Head,
}

/// What happened to a supervised child.
#[derive(Debug)]
pub struct SupervisedRun {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    /// Stdout was longer than the output limit and lost bytes.
    pub stdout_truncated: bool,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl SupervisedRun {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }

    pub fn describe_exit(&self) -> String {
        if self.timed_out {
            return format!("timed out after {}s", self.elapsed.as_secs());
        }
        match (self.status.code(), self.status.signal()) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("terminated by signal {}", sig),
            (None, None) => "unknown exit".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessSupervisor {
    wall_clock: Duration,
    kill_grace: Duration,
    output_limit: usize,
    capture: OutputCapture,
}

impl ProcessSupervisor {
    pub fn new(wall_clock: Duration) -> Self {
        Self {
            wall_clock,
            kill_grace: DEFAULT_KILL_GRACE,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            capture: OutputCapture::Tail,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Keep at most this many bytes of stdout and of stderr.
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    pub fn with_capture(mut self, capture: OutputCapture) -> Self {
        self.capture = capture;
        self
    }

    pub fn wall_clock(&self) -> Duration {
        self.wall_clock
    }

    /// Spawn `cmd` through `backend` and wait for it under the wall-clock cap.
    pub async fn run<B>(&self, backend: &B, mut cmd: Command) -> io::Result<SupervisedRun>
    where
        B: SandboxBackend + ?Sized,
    {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = backend.spawn(cmd)?;
        let pid = child.id();
        debug!(pid = ?pid, "supervised process started");

        let (limit, capture) = (self.output_limit, self.capture);
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_bounded(pipe, limit, capture)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_bounded(pipe, limit, capture)));

        let (status, timed_out) = match time::timeout(self.wall_clock, child.wait()).await {
            Ok(status) => (status?, false),
            Err(_) => {
                warn!(
                    pid = ?pid,
                    cap_secs = self.wall_clock.as_secs(),
                    "wall-clock cap reached, terminating process group"
                );
                (self.terminate(&mut child, pid).await?, true)
            }
        };
        let elapsed = started.elapsed();

        // Whatever the leader left behind in its group goes with it.
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGKILL);
        }

        let (stdout, stdout_truncated) = self.collect(stdout).await;
        let (stderr, _) = self.collect(stderr).await;

        Ok(SupervisedRun {
            status,
            stdout,
            stderr,
            stdout_truncated,
            timed_out,
            elapsed,
        })
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> io::Result<ExitStatus> {
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGTERM);
        }
        match time::timeout(self.kill_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pid = ?pid, "process ignored SIGTERM, sending SIGKILL");
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                if let Err(err) = child.start_kill() {
                    debug!("start_kill after SIGKILL: {}", err);
                }
                child.wait().await
            }
        }
    }

    async fn collect(
        &self,
        reader: Option<JoinHandle<io::Result<Captured>>>,
    ) -> (String, bool) {
        let Some(handle) = reader else {
            return (String::new(), false);
        };
        let abort = handle.abort_handle();
        match time::timeout(self.kill_grace, handle).await {
            Ok(Ok(Ok(captured))) => (
                String::from_utf8_lossy(&captured.bytes).into_owned(),
                captured.truncated,
            ),
            Ok(Ok(Err(err))) => {
                warn!("failed to read child output: {}", err);
                (String::new(), false)
            }
            Ok(Err(err)) => {
                warn!("output reader task failed: {}", err);
                (String::new(), false)
            }
            Err(_) => {
                warn!("child output still open after exit, dropping it");
                abort.abort();
                (String::new(), false)
            }
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, ?signal, "killpg failed: {}", err),
    }
}

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Drain `reader` to EOF, keeping at most `limit` bytes from the chosen end.
/// The pipe is always read to the end so the child never blocks on it.
async fn read_bounded<R>(
    mut reader: R,
    limit: usize,
    capture: OutputCapture,
) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        match capture {
            OutputCapture::Head => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..read.min(room)]);
                truncated |= read > room;
            }
            OutputCapture::Tail => {
                kept.extend_from_slice(&chunk[..read]);
                if kept.len() > limit.saturating_mul(2) {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                    truncated = true;
                }
            }
        }
    }
    if kept.len() > limit {
        let excess = kept.len() - limit;
        kept.drain(..excess);
        truncated = true;
    }
    Ok(Captured {
        bytes: kept,
        truncated,
    })
}
