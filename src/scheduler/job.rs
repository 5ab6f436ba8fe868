use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Granularity of the impact-score tie-break. Scores are quantized to this
/// step at submission so the queue comparator stays a strict weak order;
/// comparing raw floats with a tolerance is not transitive.
pub const IMPACT_GRANULARITY: f64 = 0.001;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Hardware a test case needs before it can run anywhere. A job without a
/// requirement matches any environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRequirement {
    /// Exact-match architecture string, e.g. "x86_64" or "arm64".
    pub architecture: String,
    pub min_memory_mb: u32,
    /// Peripheral types the environment must provide (superset match).
    #[serde(default)]
    pub peripherals: HashSet<String>,
}

impl HardwareRequirement {
    pub fn validate(&self) -> Result<()> {
        if self.architecture.is_empty() {
            return Err(SchedulerError::InvalidHardwareRequirement(
                "architecture must not be empty".to_string(),
            ));
        }
        if self.min_memory_mb == 0 {
            return Err(SchedulerError::InvalidHardwareRequirement(
                "min_memory_mb must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Test case handed over by the generation subsystem. The scheduler treats
/// `command` as an opaque payload for the runner; it only inspects the
/// hardware requirement, the duration estimate, and `target_subsystem`
/// (the reprioritizer keys on it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    /// Kernel subsystem the test exercises, e.g. "mm" or "net".
    pub target_subsystem: String,
    pub command: String,
    #[serde(default)]
    pub hardware: Option<HardwareRequirement>,
    pub estimated_duration_secs: u64,
}

impl TestSpec {
    pub fn execution_estimate(&self) -> Duration {
        Duration::from_secs(self.estimated_duration_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Timeout,
    Error,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Timeout => write!(f, "timeout"),
            TestStatus::Error => write!(f, "error"),
        }
    }
}

/// Failure classification attached by the runner or the analysis subsystem.
/// The taxonomy of `kind` is owned externally; the scheduler only reads
/// `fatal` when deciding whether to escalate related queued jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMetadata {
    pub fatal: bool,
    pub kind: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl FailureMetadata {
    pub fn kernel_panic(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            kind: "kernel_panic".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn nonfatal(kind: impl Into<String>) -> Self {
        Self {
            fatal: false,
            kind: kind.into(),
            message: None,
        }
    }
}

/// Outcome of one execution attempt, as reported by the Test Runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    #[serde(default)]
    pub failure: Option<FailureMetadata>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl TestResult {
    pub fn passed() -> Self {
        Self {
            status: TestStatus::Passed,
            failure: None,
            detail: None,
        }
    }

    pub fn failed(failure: FailureMetadata) -> Self {
        Self {
            status: TestStatus::Failed,
            failure: Some(failure),
            detail: None,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: TestStatus::Timeout,
            failure: None,
            detail: None,
        }
    }

    /// Wrap an infrastructure fault (runner exception, lost connection,
    /// panicked task) so it flows through the normal failure path.
    pub fn infrastructure_error(detail: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Error,
            failure: None,
            detail: Some(detail.into()),
        }
    }

    /// A failed run whose metadata marks a fatal condition (kernel panic).
    /// Only these trigger reprioritization of related queued jobs.
    pub fn is_critical_failure(&self) -> bool {
        self.status == TestStatus::Failed && self.failure.as_ref().is_some_and(|f| f.fatal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Passed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Passed => write!(f, "passed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Submission payload for `TestScheduler::submit_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub spec: TestSpec,
    #[serde(default)]
    pub priority: JobPriority,
    pub impact_score: f64,
    #[serde(default)]
    pub dependencies: HashSet<Uuid>,
    /// Overrides the scheduler-wide default when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitRequest {
    pub fn new(spec: TestSpec, priority: JobPriority, impact_score: f64) -> Self {
        Self {
            spec,
            priority,
            impact_score,
            dependencies: HashSet::new(),
            max_retries: None,
        }
    }

    pub fn with_dependency(mut self, dependency: Uuid) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.impact_score.is_finite() || !(0.0..=1.0).contains(&self.impact_score) {
            return Err(SchedulerError::InvalidImpactScore(self.impact_score));
        }
        if self.spec.estimated_duration_secs == 0 {
            return Err(SchedulerError::InvalidExecutionEstimate);
        }
        if let Some(hardware) = &self.spec.hardware {
            hardware.validate()?;
        }
        Ok(())
    }
}

/// A queued request to run one test case against a matching environment.
///
/// Each job id lives in exactly one of the scheduler's three tables at any
/// instant: the priority queue, the running table, or the completed table.
/// `retry_count` never exceeds `max_retries`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: TestSpec,
    pub priority: JobPriority,
    pub impact_score: f64,
    /// `impact_score` rounded to integer thousandths; the ordering key.
    pub impact_rank: u16,
    pub dependencies: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Monotonic submission counter; breaks `created_at` ties so FIFO holds
    /// even for jobs admitted within the same clock tick.
    pub seq: u64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: JobState,
    pub result: Option<TestResult>,
}

impl Job {
    /// Build a freshly admitted job. Callers validate the request first;
    /// `seq` comes from the scheduler's submission counter.
    pub fn new(request: SubmitRequest, default_max_retries: u32, seq: u64) -> Self {
        let max_retries = request.max_retries.unwrap_or(default_max_retries);
        Self {
            id: Uuid::new_v4(),
            impact_rank: impact_rank(request.impact_score),
            spec: request.spec,
            priority: request.priority,
            impact_score: request.impact_score,
            dependencies: request.dependencies,
            created_at: Utc::now(),
            seq,
            scheduled_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            state: JobState::Queued,
            result: None,
        }
    }

    pub fn execution_estimate(&self) -> Duration {
        self.spec.execution_estimate()
    }
}

/// Quantize an impact score to its ordering rank (0..=1000 for valid scores).
pub fn impact_rank(score: f64) -> u16 {
    (score / IMPACT_GRANULARITY).round() as u16
}
