use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 30714;
const DEFAULT_RESULT_PATH: &str = "/tmp/planner-results";
const DEFAULT_ADDRESS_SPACE_KB: u64 = 400_000;
const DEFAULT_TOLERANCE: f64 = 0.001;

/// Contents of `planductor-worker.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub dispatcher: DispatcherEndpoint,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub validator: ValidatorSettings,
    #[serde(default)]
    pub dependencies: DependencySettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CA bundle used to verify the dispatcher; plain TCP when absent.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Name expected in the dispatcher certificate, defaults to `host`.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for DispatcherEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ca_file: None,
            server_name: None,
        }
    }
}

impl DispatcherEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_sandbox_runner")]
    pub sandbox_runner: PathBuf,
    /// Parent directory for per-cycle sandbox and staging directories.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    #[serde(default = "default_root")]
    pub planner_root: PathBuf,
    #[serde(default = "default_root")]
    pub benchmark_root: PathBuf,
    /// Result file path as seen by the planner inside the sandbox.
    #[serde(default = "default_result_path")]
    pub result_path: String,
    #[serde(default = "default_address_space_kb")]
    pub address_space_kb: u64,
    #[serde(default = "default_wall_clock_slack_secs")]
    pub wall_clock_slack_secs: u64,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            sandbox_runner: default_sandbox_runner(),
            work_root: default_work_root(),
            planner_root: default_root(),
            benchmark_root: default_root(),
            result_path: default_result_path(),
            address_space_kb: default_address_space_kb(),
            wall_clock_slack_secs: default_wall_clock_slack_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            output_limit_bytes: default_output_limit_bytes(),
        }
    }
}

impl ExecutorSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorSettings {
    #[serde(default = "default_validator_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_validator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            binary: default_validator_binary(),
            tolerance: default_tolerance(),
            timeout_secs: default_validator_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencySettings {
    /// Base URL that `planner_url`/`domain_url` are relative to.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

/// What to do when the dispatcher has nothing left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    #[default]
    Exit,
    Poll,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub idle: IdlePolicy,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cycle_pause_secs")]
    pub cycle_pause_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle: IdlePolicy::default(),
            poll_interval_secs: default_poll_interval_secs(),
            cycle_pause_secs: default_cycle_pause_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

impl SessionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_secs(self.cycle_pause_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs.max(1))
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_sandbox_runner() -> PathBuf {
    PathBuf::from("mbox")
}

fn default_work_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_result_path() -> String {
    DEFAULT_RESULT_PATH.to_string()
}

fn default_address_space_kb() -> u64 {
    DEFAULT_ADDRESS_SPACE_KB
}

fn default_wall_clock_slack_secs() -> u64 {
    30
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_output_limit_bytes() -> usize {
    64 * 1024
}

fn default_validator_binary() -> PathBuf {
    PathBuf::from("validate")
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

fn default_validator_timeout_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_cycle_pause_secs() -> u64 {
    1
}

fn default_ack_timeout_secs() -> u64 {
    30
}

pub fn parse_settings(contents: &str) -> Result<WorkerSettings, toml::de::Error> {
    toml::from_str(contents)
}

/// Load worker settings, falling back to defaults when the file is absent
/// or unreadable.
pub fn load_settings(config_path: Option<&Path>) -> WorkerSettings {
    let Some(path) = config_path else {
        return WorkerSettings::default();
    };

    let contents = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to read config file {}: {}", path.display(), err);
            return WorkerSettings::default();
        }
    };

    match parse_settings(&contents) {
        Ok(settings) => {
            info!("Loaded worker configuration from {}", path.display());
            settings
        }
        Err(err) => {
            warn!("Failed to parse {}: {}", path.display(), err);
            WorkerSettings::default()
        }
    }
}
