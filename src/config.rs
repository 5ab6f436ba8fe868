use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SchedulerError};
use crate::scheduler::environment::{Environment, HardwareProfile};

/// Tunables for the scheduler core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Re-execution budget for jobs that submit without their own.
    pub default_max_retries: u32,
    /// Admission stops once this many jobs are queued.
    pub max_queued_jobs: usize,
    /// Hard ceiling handed to the runner for every execution.
    pub execution_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            max_queued_jobs: 10_000,
            execution_timeout: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.max_queued_jobs = capacity;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }
}

/// One entry in an environment inventory file.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentSpec {
    pub id: String,
    pub architecture: String,
    pub memory_mb: u32,
    #[serde(default)]
    pub peripherals: HashSet<String>,
    #[serde(default)]
    pub is_virtual: bool,
}

impl EnvironmentSpec {
    pub fn into_environment(self) -> Environment {
        Environment::new(
            self.id,
            HardwareProfile {
                architecture: self.architecture,
                memory_mb: self.memory_mb,
                peripherals: self.peripherals,
                is_virtual: self.is_virtual,
            },
        )
    }
}

/// Load an environment inventory from a JSON file: an array of
/// [`EnvironmentSpec`] entries. A file that names the same id twice is
/// rejected.
pub fn load_environments(path: impl AsRef<Path>) -> Result<Vec<Environment>> {
    let raw = std::fs::read_to_string(path)?;
    let specs: Vec<EnvironmentSpec> = serde_json::from_str(&raw)?;
    let mut seen = HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.id.as_str()) {
            return Err(SchedulerError::DuplicateEnvironment(spec.id.clone()));
        }
    }
    Ok(specs.into_iter().map(EnvironmentSpec::into_environment).collect())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::scheduler::environment::EnvironmentStatus;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.default_max_retries, 3);
        assert_eq!(cfg.max_queued_jobs, 10_000);
        assert_eq!(cfg.execution_timeout, Duration::from_secs(600));
    }

    #[test]
    fn scheduler_config_builders() {
        let cfg = SchedulerConfig::default()
            .with_max_retries(1)
            .with_queue_capacity(16)
            .with_execution_timeout(Duration::from_secs(30));
        assert_eq!(cfg.default_max_retries, 1);
        assert_eq!(cfg.max_queued_jobs, 16);
        assert_eq!(cfg.execution_timeout, Duration::from_secs(30));
    }

    #[test]
    fn load_environments_parses_inventory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "qemu-x86-0", "architecture": "x86_64", "memory_mb": 4096, "is_virtual": true}},
                {{"id": "rpi4-lab-1", "architecture": "arm64", "memory_mb": 2048, "peripherals": ["usb", "gpio"]}}
            ]"#
        )
        .unwrap();

        let environments = load_environments(file.path()).unwrap();
        assert_eq!(environments.len(), 2);

        assert_eq!(environments[0].id, "qemu-x86-0");
        assert!(environments[0].profile.is_virtual);
        assert!(environments[0].profile.peripherals.is_empty());
        assert_eq!(environments[0].status, EnvironmentStatus::Idle);

        assert_eq!(environments[1].profile.architecture, "arm64");
        assert!(!environments[1].profile.is_virtual);
        assert!(environments[1].profile.peripherals.contains("gpio"));
    }

    #[test]
    fn load_environments_rejects_duplicate_ids() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "qemu-x86-0", "architecture": "x86_64", "memory_mb": 4096}},
                {{"id": "qemu-x86-0", "architecture": "arm64", "memory_mb": 2048}}
            ]"#
        )
        .unwrap();

        match load_environments(file.path()) {
            Err(SchedulerError::DuplicateEnvironment(id)) => assert_eq!(id, "qemu-x86-0"),
            other => panic!("expected duplicate id rejection, got {other:?}"),
        }
    }

    #[test]
    fn load_environments_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(load_environments(file.path()).is_err());
    }

    #[test]
    fn load_environments_missing_file() {
        assert!(load_environments("/nonexistent/environments.json").is_err());
    }
}
