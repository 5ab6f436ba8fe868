use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::runner::TestRunner;
use crate::scheduler::environment::{Environment, EnvironmentPool, ResourceAllocation};
use crate::scheduler::job::{
    Job, JobPriority, JobState, SubmitRequest, TestResult, TestStatus,
};
use crate::scheduler::queue::JobQueue;

/// Notifications pushed to subscribers as jobs move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    JobSubmitted { job_id: Uuid },
    JobStarted { job_id: Uuid, environment_id: String },
    JobRetried { job_id: Uuid, attempt: u32 },
    JobSucceeded { job_id: Uuid },
    JobFailed { job_id: Uuid },
    JobCancelled { job_id: Uuid },
}

/// Point-in-time view of one job, safe to hand out past the lock.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub target_subsystem: String,
    pub state: JobState,
    pub priority: JobPriority,
    pub impact_score: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TestResult>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.spec.name.clone(),
            target_subsystem: job.spec.target_subsystem.clone(),
            state: job.state,
            priority: job.priority,
            impact_score: job.impact_score,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            completed_at: job.completed_at,
            result: job.result.clone(),
        }
    }
}

/// Aggregate counters for the dashboard and CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub environments_total: usize,
    pub environments_idle: usize,
    pub environments_allocated: usize,
}

/// Everything the scheduler mutates, behind one lock.
///
/// Admission, allocation, and completion each take the write guard once and
/// do all their bookkeeping before releasing it, so no interleaving can
/// observe a job in two tables or an environment double-allocated.
struct SchedulerState {
    queue: JobQueue,
    running: HashMap<Uuid, Job>,
    completed: HashMap<Uuid, Job>,
    environments: EnvironmentPool,
    allocations: HashMap<Uuid, ResourceAllocation>,
    next_seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<SchedulerEvent>>,
    shutting_down: bool,
}

/// Priority scheduler for kernel test jobs.
///
/// Jobs are admitted into a priority queue and dispatched to matching idle
/// environments as capacity allows. Each dispatch runs on its own task; when
/// the run reports back the environment is released, the job is retried or
/// finalized, and the queue is drained again.
#[derive(Clone)]
pub struct TestScheduler {
    state: Arc<RwLock<SchedulerState>>,
    runner: Arc<dyn TestRunner>,
    config: SchedulerConfig,
}

impl TestScheduler {
    pub fn new(config: SchedulerConfig, runner: Arc<dyn TestRunner>) -> Self {
        let state = SchedulerState {
            queue: JobQueue::with_capacity(config.max_queued_jobs),
            running: HashMap::new(),
            completed: HashMap::new(),
            environments: EnvironmentPool::new(),
            allocations: HashMap::new(),
            next_seq: 0,
            subscribers: Vec::new(),
            shutting_down: false,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            runner,
            config,
        }
    }

    /// Validate and enqueue a test job, then try to dispatch it right away.
    ///
    /// Dependencies must name jobs the scheduler already knows (queued,
    /// running, or completed). Returns the id assigned to the job.
    pub async fn submit_job(&self, request: SubmitRequest) -> Result<Uuid> {
        request.validate()?;

        let mut state = self.state.write().await;
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        if state.queue.is_full() {
            return Err(SchedulerError::QueueFull(self.config.max_queued_jobs));
        }
        for dependency in &request.dependencies {
            let known = state.queue.contains(dependency)
                || state.running.contains_key(dependency)
                || state.completed.contains_key(dependency);
            if !known {
                return Err(SchedulerError::UnknownDependency(*dependency));
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let job = Job::new(request, self.config.default_max_retries, seq);
        let job_id = job.id;
        tracing::info!(
            job_id = %job_id,
            name = %job.spec.name,
            priority = %job.priority,
            impact = job.impact_score,
            "Job submitted"
        );
        state.queue.push(job);
        Self::emit(&mut state, SchedulerEvent::JobSubmitted { job_id });
        self.schedule_pending(&mut state);
        Ok(job_id)
    }

    /// Dispatch queued jobs while an idle environment matches the head of the
    /// queue. Called under the write guard after every state change that can
    /// unblock a job.
    fn schedule_pending(&self, state: &mut SchedulerState) {
        if state.shutting_down {
            return;
        }
        loop {
            if state.environments.idle_count() == 0 {
                break;
            }
            let completed = &state.completed;
            let Some(mut job) = state
                .queue
                .find_schedulable(|id| completed.contains_key(id))
            else {
                break;
            };
            let Some(environment) = state.environments.allocate_best(job.spec.hardware.as_ref())
            else {
                // Idle capacity exists but nothing satisfies this job's
                // hardware requirement. The head of the queue waits rather
                // than letting lower-priority work overtake it.
                state.queue.restore(job);
                break;
            };

            let now = Utc::now();
            job.state = JobState::Running;
            job.scheduled_at = Some(now);
            state.allocations.insert(
                job.id,
                ResourceAllocation {
                    environment_id: environment.id.clone(),
                    job_id: job.id,
                    allocated_at: now,
                    estimated_duration: job.execution_estimate(),
                },
            );
            tracing::info!(job_id = %job.id, environment_id = %environment.id, "Job allocated");
            Self::emit(
                state,
                SchedulerEvent::JobStarted {
                    job_id: job.id,
                    environment_id: environment.id.clone(),
                },
            );
            self.spawn_execution(&job, environment);
            state.running.insert(job.id, job);
        }
    }

    /// Run one job on its own task and feed the outcome back in.
    ///
    /// The runner call is spawned a second time so a panicking runner is
    /// caught as a join error instead of taking the dispatcher down with it.
    fn spawn_execution(&self, job: &Job, environment: Environment) {
        let scheduler = self.clone();
        let runner = Arc::clone(&self.runner);
        let spec = job.spec.clone();
        let job_id = job.id;
        let timeout = self.config.execution_timeout;
        tokio::spawn(async move {
            let execution =
                tokio::spawn(async move { runner.execute(&spec, &environment, timeout).await });
            let result = match execution.await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    tracing::error!(job_id = %job_id, error = %err, "Test execution failed");
                    TestResult::infrastructure_error(err.to_string())
                }
                Err(join_err) => {
                    tracing::error!(job_id = %job_id, error = %join_err, "Test runner panicked");
                    TestResult::infrastructure_error(format!("runner panicked: {join_err}"))
                }
            };
            scheduler.handle_completion(job_id, result).await;
        });
    }

    /// Release the job's environment, then retry or finalize it.
    async fn handle_completion(&self, job_id: Uuid, result: TestResult) {
        let mut state = self.state.write().await;
        let Some(mut job) = state.running.remove(&job_id) else {
            tracing::warn!(job_id = %job_id, "Completion reported for a job that is not running");
            return;
        };
        if let Some(allocation) = state.allocations.remove(&job_id) {
            if !state.environments.release(&allocation.environment_id) {
                tracing::warn!(
                    environment_id = %allocation.environment_id,
                    "Completed on an environment that is no longer registered"
                );
            }
        }

        if result.status == TestStatus::Passed {
            tracing::info!(job_id = %job_id, "Job passed");
            self.finalize(&mut state, job, JobState::Passed, Some(result));
        } else if job.retry_count < job.max_retries && !state.shutting_down {
            job.retry_count += 1;
            job.scheduled_at = None;
            job.state = JobState::Queued;
            tracing::warn!(
                job_id = %job_id,
                status = %result.status,
                attempt = job.retry_count,
                max_retries = job.max_retries,
                "Job failed, requeueing"
            );
            Self::emit(
                &mut state,
                SchedulerEvent::JobRetried {
                    job_id,
                    attempt: job.retry_count,
                },
            );
            state.queue.restore(job);
        } else {
            tracing::warn!(job_id = %job_id, status = %result.status, "Job failed permanently");
            self.finalize(&mut state, job, JobState::Failed, Some(result));
        }

        // A freed environment or a newly terminal dependency may unblock
        // queued work.
        self.schedule_pending(&mut state);
    }

    /// Move a job into the completed table and emit its terminal event.
    fn finalize(
        &self,
        state: &mut SchedulerState,
        mut job: Job,
        final_state: JobState,
        result: Option<TestResult>,
    ) {
        debug_assert!(final_state.is_terminal());
        job.state = final_state;
        job.completed_at = Some(Utc::now());
        job.result = result;
        let event = match final_state {
            JobState::Passed => SchedulerEvent::JobSucceeded { job_id: job.id },
            JobState::Cancelled => SchedulerEvent::JobCancelled { job_id: job.id },
            _ => SchedulerEvent::JobFailed { job_id: job.id },
        };
        state.completed.insert(job.id, job);
        Self::emit(state, event);
    }

    /// Promote queued jobs that target the same kernel subsystem as any
    /// critical failure in `recent_results`. Returns how many were promoted.
    ///
    /// A critical failure (kernel panic or other fatal report) suggests the
    /// subsystem is in a bad state right now, so pending coverage of it
    /// should not sit behind routine work.
    pub async fn reschedule_based_on_results(
        &self,
        recent_results: &[(Uuid, TestResult)],
    ) -> usize {
        let mut state = self.state.write().await;
        let mut hot_subsystems: HashSet<String> = HashSet::new();
        for (job_id, result) in recent_results {
            if !result.is_critical_failure() {
                continue;
            }
            let subsystem = state
                .completed
                .get(job_id)
                .or_else(|| state.running.get(job_id))
                .or_else(|| state.queue.get(job_id))
                .map(|job| job.spec.target_subsystem.clone());
            if let Some(subsystem) = subsystem {
                hot_subsystems.insert(subsystem);
            }
        }
        if hot_subsystems.is_empty() {
            return 0;
        }

        let promoted = state.queue.reprioritize(|job| {
            if hot_subsystems.contains(&job.spec.target_subsystem)
                && job.priority < JobPriority::High
            {
                job.priority = JobPriority::High;
                true
            } else {
                false
            }
        });
        if promoted > 0 {
            tracing::info!(
                promoted,
                subsystems = ?hot_subsystems,
                "Promoted queued jobs after critical failures"
            );
        }
        promoted
    }

    /// Current view of one job, wherever it lives.
    pub async fn get_job_status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let state = self.state.read().await;
        state
            .queue
            .get(&job_id)
            .or_else(|| state.running.get(&job_id))
            .or_else(|| state.completed.get(&job_id))
            .map(JobSnapshot::from)
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        let state = self.state.read().await;
        QueueStatus {
            queued: state.queue.len(),
            running: state.running.len(),
            completed: state.completed.len(),
            environments_total: state.environments.len(),
            environments_idle: state.environments.idle_count(),
            environments_allocated: state.environments.allocated_count(),
        }
    }

    /// All known jobs in submission order.
    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.state.read().await;
        let mut jobs: Vec<&Job> = state
            .queue
            .iter()
            .chain(state.running.values())
            .chain(state.completed.values())
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.seq));
        jobs.into_iter().map(JobSnapshot::from).collect()
    }

    pub async fn list_environments(&self) -> Vec<Environment> {
        let state = self.state.read().await;
        state.environments.iter().cloned().collect()
    }

    /// Cancel a queued job. Jobs already running or finished are left alone
    /// and `false` is returned.
    pub async fn cancel_job(&self, job_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        match state.queue.remove(&job_id) {
            Some(job) => {
                tracing::info!(job_id = %job_id, "Job cancelled");
                self.finalize(&mut state, job, JobState::Cancelled, None);
                // Cancellation is terminal, so dependents may now be eligible.
                self.schedule_pending(&mut state);
                true
            }
            None => false,
        }
    }

    /// Register a new environment and immediately offer it to the queue.
    pub async fn add_environment(&self, environment: Environment) -> Result<()> {
        let mut state = self.state.write().await;
        let environment_id = environment.id.clone();
        state.environments.register(environment)?;
        tracing::info!(environment_id = %environment_id, "Environment registered");
        self.schedule_pending(&mut state);
        Ok(())
    }

    /// Deregister an idle environment. Allocated environments must finish
    /// their current job first.
    pub async fn remove_environment(&self, id: &str) -> Result<Environment> {
        let mut state = self.state.write().await;
        let environment = state.environments.deregister(id)?;
        tracing::info!(environment_id = %id, "Environment deregistered");
        Ok(environment)
    }

    /// Allocations that have outlived their estimate. Detection only; the
    /// scheduler never kills a run on staleness.
    pub async fn stale_allocations(&self) -> Vec<ResourceAllocation> {
        let now = Utc::now();
        let state = self.state.read().await;
        state
            .allocations
            .values()
            .filter(|allocation| allocation.is_stale(now))
            .cloned()
            .collect()
    }

    /// Subscribe to lifecycle events. Closed receivers are pruned on the
    /// next emit.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.write().await.subscribers.push(tx);
        rx
    }

    /// Stop admitting work and cancel everything still queued. Jobs already
    /// running finish and finalize without further retries. Returns how many
    /// queued jobs were cancelled.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.write().await;
        state.shutting_down = true;
        let drained = state.queue.drain();
        let cancelled = drained.len();
        for job in drained {
            self.finalize(&mut state, job, JobState::Cancelled, None);
        }
        tracing::info!(
            cancelled,
            still_running = state.running.len(),
            "Scheduler shutting down"
        );
        cancelled
    }

    fn emit(state: &mut SchedulerState, event: SchedulerEvent) {
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
