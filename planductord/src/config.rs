use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use planductor_common::{TaskSpec, DEFAULT_MAX_MESSAGE_BYTES};
use serde::Deserialize;
use tracing::{info, warn};

use crate::registry::TaskRegistry;

pub const DEFAULT_BIND: &str = "127.0.0.1:30714";
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Contents of `planductord.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub dispatcher: ListenSettings,
    pub tls: Option<TlsSettings>,
    /// Construction-time task seed, in registration order.
    #[serde(rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub bind: String,
    pub max_message_bytes: usize,
    pub tls_handshake_timeout_secs: u64,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            tls_handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

impl ListenSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

pub fn parse_config(contents: &str) -> Result<DispatcherConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Load the dispatcher configuration, falling back to defaults when the file
/// is absent or unreadable.
pub fn load_config(config_path: Option<&Path>) -> DispatcherConfig {
    let Some(path) = config_path else {
        return DispatcherConfig::default();
    };

    let contents = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to read config file {}: {}", path.display(), err);
            return DispatcherConfig::default();
        }
    };

    match parse_config(&contents) {
        Ok(config) => {
            info!(
                tasks = config.tasks.len(),
                "Loaded dispatcher configuration from {}",
                path.display()
            );
            config
        }
        Err(err) => {
            warn!("Failed to parse {}: {}", path.display(), err);
            DispatcherConfig::default()
        }
    }
}

/// Build the registry from the configured seed, skipping unusable entries.
pub fn seed_registry(tasks: Vec<TaskSpec>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    let mut seen = HashSet::new();

    for spec in tasks {
        if let Err(err) = validate_task(&spec) {
            warn!("Task '{}' skipped: {}", spec.name, err);
            continue;
        }
        if !seen.insert(spec.name.clone()) {
            warn!("Task '{}' skipped: duplicate name", spec.name);
            continue;
        }
        if let Err(err) = registry.register(spec) {
            warn!("Task skipped: {}", err);
        }
    }

    if registry.is_empty() {
        warn!("Task registry is empty; every worker will be told there is nothing to do");
    } else {
        info!(count = registry.len(), "Registered {} task(s)", registry.len());
    }
    registry
}

fn validate_task(spec: &TaskSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        bail!("name is empty");
    }
    if spec.planner.trim().is_empty() {
        bail!("planner is empty");
    }
    if spec.duration_secs == 0 {
        bail!("duration must be greater than zero");
    }
    if spec.problem_index == Some(0) {
        bail!("problem_index is 1-based");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[dispatcher]
bind = "0.0.0.0:30714"

[tls]
cert_file = "/etc/planductor/server.pem"
key_file = "/etc/planductor/server.key"

[[task]]
name = "task1"
planner = "bsg001"
domain = "city"
problem = "deliveries1"
duration = 30

[[task]]
name = "task2"
planner = "bsg001"
domain = "city"
problem = "deliveries2"
duration = 30
domain_url = "domains/city.tar"
problem_index = 2
"#;

    #[test]
    fn parses_listen_tls_and_seed() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.dispatcher.bind, "0.0.0.0:30714");
        assert_eq!(config.dispatcher.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert!(config.tls.is_some());
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[1].domain_url.as_deref(), Some("domains/city.tar"));
        assert_eq!(config.tasks[1].problem_index, Some(2));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.dispatcher.bind, DEFAULT_BIND);
        assert!(config.tls.is_none());
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/planductord.toml")));
        assert_eq!(config.dispatcher.bind, DEFAULT_BIND);
    }

    #[test]
    fn seeding_skips_bad_and_duplicate_entries() {
        let mut config = parse_config(SAMPLE).unwrap();
        let mut zero = config.tasks[0].clone();
        zero.name = "zero".into();
        zero.duration_secs = 0;
        let duplicate = config.tasks[0].clone();
        config.tasks.push(zero);
        config.tasks.push(duplicate);

        let registry = seed_registry(config.tasks);
        let names: Vec<&str> = registry.iter().map(|record| record.id()).collect();
        assert_eq!(names, vec!["task1", "task2"]);
    }
}
