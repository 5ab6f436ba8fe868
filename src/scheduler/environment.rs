use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::HardwareRequirement;

/// An allocation past this multiple of its estimated duration is flagged
/// stale: the execution has likely wedged on the target.
pub const STALE_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Idle,
    Allocated,
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentStatus::Idle => write!(f, "idle"),
            EnvironmentStatus::Allocated => write!(f, "allocated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub architecture: String,
    pub memory_mb: u32,
    #[serde(default)]
    pub peripherals: HashSet<String>,
    /// Virtual environments (QEMU and friends) are preferred over physical
    /// boards when both satisfy a requirement.
    #[serde(default)]
    pub is_virtual: bool,
}

impl HardwareProfile {
    /// Whether this profile can host a job with the given requirement:
    /// exact architecture match, memory at or above the floor, and every
    /// required peripheral type present.
    pub fn satisfies(&self, requirement: &HardwareRequirement) -> bool {
        self.architecture == requirement.architecture
            && self.memory_mb >= requirement.min_memory_mb
            && requirement.peripherals.is_subset(&self.peripherals)
    }
}

/// A registered execution environment: a virtual machine or a physical board
/// in the lab. Provisioning is external; the scheduler only tracks status.
#[derive(Debug, Clone, Serialize)]
pub struct Environment {
    pub id: String,
    pub profile: HardwareProfile,
    pub status: EnvironmentStatus,
}

impl Environment {
    pub fn new(id: impl Into<String>, profile: HardwareProfile) -> Self {
        Self {
            id: id.into(),
            profile,
            status: EnvironmentStatus::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == EnvironmentStatus::Idle
    }
}

/// Record of one environment lent to one job, created at allocation time and
/// destroyed when the execution reports back.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceAllocation {
    pub environment_id: String,
    pub job_id: Uuid,
    pub allocated_at: DateTime<Utc>,
    pub estimated_duration: Duration,
}

impl ResourceAllocation {
    /// True once the allocation has outlived its estimate by [`STALE_FACTOR`].
    /// Purely a detection signal; nothing in the scheduler acts on it.
    ///
    /// Compared in seconds as f64: the estimate is caller-supplied and may sit
    /// near the top of the `Duration` range, where `Duration` multiplication
    /// would overflow.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.allocated_at).to_std().unwrap_or_default();
        elapsed.as_secs_f64() > self.estimated_duration.as_secs_f64() * STALE_FACTOR
    }
}

/// Registered environments in registration order. The order matters: when
/// several environments match a requirement equally, the earliest-registered
/// one wins, which keeps matching deterministic.
#[derive(Debug, Default)]
pub struct EnvironmentPool {
    environments: Vec<Environment>,
}

impl EnvironmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, environment: Environment) -> Result<()> {
        if self.environments.iter().any(|e| e.id == environment.id) {
            return Err(SchedulerError::DuplicateEnvironment(environment.id));
        }
        self.environments.push(environment);
        Ok(())
    }

    /// Deregister an environment. Fails while it is hosting a job.
    pub fn deregister(&mut self, id: &str) -> Result<Environment> {
        let index = self
            .environments
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| SchedulerError::EnvironmentNotFound(id.to_string()))?;
        if !self.environments[index].is_idle() {
            return Err(SchedulerError::EnvironmentAllocated(id.to_string()));
        }
        Ok(self.environments.remove(index))
    }

    /// Best idle environment for the requirement, if any.
    ///
    /// No requirement matches the first idle environment. Otherwise the
    /// profile must satisfy the requirement, and among satisfying
    /// environments a virtual one is preferred over physical hardware.
    pub fn find_best(&self, requirement: Option<&HardwareRequirement>) -> Option<&Environment> {
        match requirement {
            None => self.environments.iter().find(|e| e.is_idle()),
            Some(req) => {
                let mut first_match = None;
                for env in self.environments.iter().filter(|e| e.is_idle()) {
                    if !env.profile.satisfies(req) {
                        continue;
                    }
                    if env.profile.is_virtual {
                        return Some(env);
                    }
                    first_match.get_or_insert(env);
                }
                first_match
            }
        }
    }

    /// Find the best match and flip it to allocated in one step, returning a
    /// snapshot of the environment for the dispatcher.
    pub fn allocate_best(
        &mut self,
        requirement: Option<&HardwareRequirement>,
    ) -> Option<Environment> {
        let id = self.find_best(requirement)?.id.clone();
        let env = self.environments.iter_mut().find(|e| e.id == id)?;
        env.status = EnvironmentStatus::Allocated;
        Some(env.clone())
    }

    /// Return an allocated environment to the idle pool. False if the id is
    /// not registered (it was never allocatable in the first place).
    pub fn release(&mut self, id: &str) -> bool {
        match self.environments.iter_mut().find(|e| e.id == id) {
            Some(env) => {
                env.status = EnvironmentStatus::Idle;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.environments.iter()
    }

    pub fn idle_count(&self) -> usize {
        self.environments.iter().filter(|e| e.is_idle()).count()
    }

    pub fn allocated_count(&self) -> usize {
        self.environments.len() - self.idle_count()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}
