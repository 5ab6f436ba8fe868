use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid impact score {0}: must be a finite value in [0.0, 1.0]")]
    InvalidImpactScore(f64),

    #[error("Invalid hardware requirement: {0}")]
    InvalidHardwareRequirement(String),

    #[error("Invalid execution time estimate: must be greater than zero")]
    InvalidExecutionEstimate,

    #[error("Unknown dependency: {0}")]
    UnknownDependency(Uuid),

    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Environment already registered: {0}")]
    DuplicateEnvironment(String),

    #[error("Environment {0} is currently allocated")]
    EnvironmentAllocated(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Execution failure: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
