use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::Result;
use crate::runner::TestRunner;
use crate::scheduler::environment::Environment;
use crate::scheduler::job::{FailureMetadata, TestResult, TestSpec};

/// Drives the scheduler without real hardware: sleeps for a scaled-down
/// execution estimate, then reports a randomized outcome.
#[derive(Debug, Clone)]
pub struct SimulatedRunner {
    /// Fraction of runs that fail.
    failure_rate: f64,
    /// Fraction of failures reported as kernel panics.
    fatal_rate: f64,
    /// Multiplier applied to each spec's estimated duration.
    time_scale: f64,
}

impl SimulatedRunner {
    pub fn new(failure_rate: f64, fatal_rate: f64, time_scale: f64) -> Self {
        Self {
            failure_rate,
            fatal_rate,
            time_scale,
        }
    }

    /// Runner that always passes, at one hundredth of real time.
    pub fn reliable() -> Self {
        Self::new(0.0, 0.0, 0.01)
    }
}

impl Default for SimulatedRunner {
    fn default() -> Self {
        Self::new(0.2, 0.25, 0.01)
    }
}

#[async_trait]
impl TestRunner for SimulatedRunner {
    async fn execute(
        &self,
        spec: &TestSpec,
        environment: &Environment,
        timeout: Duration,
    ) -> Result<TestResult> {
        // thread_rng is not Send, so all sampling happens before the await.
        let (simulated, outcome) = {
            let mut rng = rand::thread_rng();
            // Scaled in f64 seconds: estimates near the top of the Duration
            // range would overflow Duration multiplication. A product beyond
            // the representable range clamps to Duration::MAX and is cut off
            // by the timeout below.
            let scaled = spec.execution_estimate().as_secs_f64() * self.time_scale;
            let simulated = Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX);
            let outcome = if rng.gen::<f64>() < self.failure_rate {
                if rng.gen::<f64>() < self.fatal_rate {
                    TestResult::failed(FailureMetadata::kernel_panic(format!(
                        "simulated panic in {}",
                        spec.target_subsystem
                    )))
                } else {
                    TestResult::failed(FailureMetadata::nonfatal("assertion_failed"))
                }
            } else {
                TestResult::passed()
            };
            (simulated, outcome)
        };

        if simulated > timeout {
            tokio::time::sleep(timeout).await;
            tracing::debug!(
                test = %spec.name,
                environment_id = %environment.id,
                "Simulated run hit the execution timeout"
            );
            return Ok(TestResult::timed_out());
        }

        tokio::time::sleep(simulated).await;
        tracing::debug!(
            test = %spec.name,
            environment_id = %environment.id,
            status = %outcome.status,
            "Simulated run finished"
        );
        Ok(outcome)
    }
}
