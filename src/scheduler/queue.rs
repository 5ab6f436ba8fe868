use std::cmp::Ordering;
use std::collections::BinaryHeap;

use uuid::Uuid;

use crate::scheduler::job::Job;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Heap entry ordering: priority descending, impact rank descending,
/// then submission order ascending (created_at, seq) for FIFO among equals.
#[derive(Debug)]
struct QueuedJob(Job);

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| self.0.impact_rank.cmp(&other.0.impact_rank))
            .then_with(|| other.0.created_at.cmp(&self.0.created_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

/// Priority queue of admitted-but-not-yet-running jobs.
///
/// The heap alone decides *order*; whether the head may actually run is a
/// separate question answered by [`JobQueue::find_schedulable`], which also
/// consults dependency state.
#[derive(Debug)]
pub struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_jobs,
        }
    }

    /// Admit a new job. Returns false if the queue is at capacity.
    pub fn push(&mut self, job: Job) -> bool {
        if self.heap.len() >= self.max_jobs {
            return false;
        }
        self.heap.push(QueuedJob(job));
        true
    }

    /// Put a job back that was previously popped (an unmatched candidate or
    /// a retry). Bypasses the capacity check: the job was already admitted
    /// once and dropping it here would lose it.
    pub fn restore(&mut self, job: Job) {
        self.heap.push(QueuedJob(job));
    }

    /// Pop the highest-ordered job whose dependencies are all completed.
    ///
    /// Walks the heap in priority order, setting aside jobs that are still
    /// blocked; everything set aside is pushed back unchanged before
    /// returning. Dependency state cannot change mid-scan (the caller holds
    /// the scheduler lock), so one linear pass per trigger is sufficient as
    /// long as a fresh pass runs after every submission and completion.
    pub fn find_schedulable<F>(&mut self, is_completed: F) -> Option<Job>
    where
        F: Fn(&Uuid) -> bool,
    {
        let mut blocked = Vec::new();
        let mut candidate = None;

        while let Some(QueuedJob(job)) = self.heap.pop() {
            if job.dependencies.iter().all(&is_completed) {
                candidate = Some(job);
                break;
            }
            blocked.push(job);
        }

        for job in blocked {
            self.heap.push(QueuedJob(job));
        }
        candidate
    }

    /// Remove a specific job from the queue, rebuilding the heap around it.
    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let mut removed = None;
        let entries = std::mem::take(&mut self.heap);
        for QueuedJob(job) in entries {
            if removed.is_none() && job.id == *id {
                removed = Some(job);
            } else {
                self.heap.push(QueuedJob(job));
            }
        }
        removed
    }

    /// Apply `adjust` to every queued job and re-heapify. Returns how many
    /// jobs the closure reported as changed. Priority mutation invalidates
    /// heap order, so the heap is rebuilt unconditionally.
    pub fn reprioritize<F>(&mut self, mut adjust: F) -> usize
    where
        F: FnMut(&mut Job) -> bool,
    {
        let mut changed = 0;
        let entries = std::mem::take(&mut self.heap);
        for QueuedJob(mut job) in entries {
            if adjust(&mut job) {
                changed += 1;
            }
            self.heap.push(QueuedJob(job));
        }
        changed
    }

    /// Remove and return every queued job (used by shutdown).
    pub fn drain(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.heap)
            .into_iter()
            .map(|QueuedJob(job)| job)
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.heap.iter().map(|entry| &entry.0).find(|j| j.id == *id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Iterate queued jobs in arbitrary (heap-internal) order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.heap.iter().map(|entry| &entry.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.max_jobs
    }
}
