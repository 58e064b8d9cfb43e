use super::SandboxBackend;
use std::io;
use tokio::process::{Child, Command};

/// Sets `RLIMIT_CPU` / `RLIMIT_AS` in the child between fork and exec.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSandbox {
    cpu_limit_secs: Option<u64>,
    memory_limit_bytes: Option<u64>,
}

impl RlimitSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_limit_secs(&self) -> Option<u64> {
        self.cpu_limit_secs
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_bytes
    }
}

impl SandboxBackend for RlimitSandbox {
    fn set_cpu_limit(&mut self, secs: u64) {
        self.cpu_limit_secs = Some(secs);
    }

    fn set_memory_limit(&mut self, bytes: u64) {
        self.memory_limit_bytes = Some(bytes);
    }

    fn spawn(&self, mut cmd: Command) -> io::Result<Child> {
        let limits = *self;
        cmd.process_group(0).kill_on_drop(true);
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || apply_resource_limits(&limits));
        }
        cmd.spawn()
    }
}

fn apply_resource_limits(limits: &RlimitSandbox) -> io::Result<()> {
    use libc::{rlim_t, rlimit, setrlimit, RLIMIT_AS, RLIMIT_CPU};

    if let Some(bytes) = limits.memory_limit_bytes {
        let as_limit = rlimit {
            rlim_cur: bytes as rlim_t,
            rlim_max: bytes as rlim_t,
        };
        let ret = unsafe { setrlimit(RLIMIT_AS, &as_limit) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if let Some(secs) = limits.cpu_limit_secs {
        let cpu = rlimit {
            rlim_cur: secs as rlim_t,
            rlim_max: secs as rlim_t,
        };
        let ret = unsafe { setrlimit(RLIMIT_CPU, &cpu) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn limits_are_visible_to_the_child() {
        let mut sandbox = RlimitSandbox::new();
        sandbox.set_cpu_limit(7);
        sandbox.set_memory_limit(500_000 * 1024);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("ulimit -t; ulimit -v")
            .stdout(Stdio::piped());

        let output = sandbox.spawn(cmd).unwrap().wait_with_output().await.unwrap();
        assert!(output.status.success());
        let text = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["7", "500000"]);
    }

    #[tokio::test]
    async fn unset_limits_leave_the_child_alone() {
        let sandbox = RlimitSandbox::new();
        assert_eq!(sandbox.cpu_limit_secs(), None);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 0");
        let status = sandbox.spawn(cmd).unwrap().wait().await.unwrap();
        assert!(status.success());
    }
}
