pub mod engine;
pub mod environment;
pub mod job;
pub mod queue;

pub use engine::{JobSnapshot, QueueStatus, SchedulerEvent, TestScheduler};
pub use environment::{Environment, EnvironmentPool, EnvironmentStatus, HardwareProfile};
pub use job::{
    FailureMetadata, HardwareRequirement, Job, JobPriority, JobState, SubmitRequest, TestResult,
    TestSpec, TestStatus,
};
pub use queue::JobQueue;
