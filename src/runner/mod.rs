pub mod sim;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::environment::Environment;
use crate::scheduler::job::{TestResult, TestSpec};

pub use sim::SimulatedRunner;

/// Executes one test case on an allocated environment.
///
/// `timeout` is a hard ceiling: an implementation that cannot finish within
/// it reports `TestStatus::Timeout` instead of hanging the dispatcher. An
/// `Err` means infrastructure trouble (environment unreachable, harness
/// broken), not a test that merely failed; failing tests come back as an
/// `Ok` result carrying failure metadata.
#[async_trait]
pub trait TestRunner: Send + Sync + 'static {
    async fn execute(
        &self,
        spec: &TestSpec,
        environment: &Environment,
        timeout: Duration,
    ) -> Result<TestResult>;
}
