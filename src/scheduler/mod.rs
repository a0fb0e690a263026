//! Discovery job scheduler
//!
//! A fixed pool of worker tasks pulls the best ready job from a shared
//! [`JobQueue`], runs it through a [`JobExecutor`] under a deadline and turns
//! the outcome into the next state: done, a retry after backoff, a terminal
//! failure (published as a `DiscoveryError` event), or the next run of a
//! recurring job.

pub mod adaptive;
pub mod job;
pub mod queue;
pub mod retry;

pub use adaptive::AdaptiveInterval;
pub use job::{DiscoveryJob, JobId, JobOutcome, JobPriority, JobStatus, SchedulePolicy};
pub use queue::JobQueue;
pub use retry::{BackoffStrategy, RetryPolicy};

use crate::config::SchedulerConfig;
use crate::device::DiscoveryResult;
use crate::error::{EngineError, Result};
use crate::events::{DiscoveryEvent, EventBus};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Finished one-shot jobs kept for `job()` and `wait_for()` lookups
const FINISHED_RETENTION: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs one attempt of a job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &DiscoveryJob) -> Result<DiscoveryResult>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub running: usize,
    pub pending: usize,
    pub total_jobs: usize,
    pub total_execution_ms: u64,
    pub workers: usize,
}

type OutcomeSender = Arc<watch::Sender<Option<JobOutcome>>>;

struct JobEntry {
    job: DiscoveryJob,
    adaptive: Option<AdaptiveInterval>,
    outcome: OutcomeSender,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobEntry>,
    queue: JobQueue,
    running: HashSet<JobId>,
    finished: Vec<JobId>,
    stats: SchedulerStats,
    shutdown: bool,
}

impl SchedulerState {
    fn remember_finished(&mut self, id: JobId) {
        self.finished.push(id);
        while self.finished.len() > FINISHED_RETENTION {
            let oldest = self.finished.remove(0);
            self.jobs.remove(&oldest);
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    executor: Arc<dyn JobExecutor>,
    event_bus: Arc<EventBus>,
    state: Mutex<SchedulerState>,
    wake: Notify,
}

/// Priority job scheduler with a bounded worker pool
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

enum Step {
    Run(DiscoveryJob),
    Wait(Option<Instant>),
    Exit,
}

/// What a finished attempt means for the job
struct Attempt {
    result: Option<DiscoveryResult>,
    failure: Option<Failure>,
    elapsed: Duration,
}

struct Failure {
    message: String,
    kind: String,
    recoverable: bool,
}

/// Side effects of a completed attempt, applied after the state lock is released
#[derive(Default)]
struct Completion {
    error_event: Option<DiscoveryEvent>,
    outcome: Option<(OutcomeSender, JobOutcome)>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn JobExecutor>, event_bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                event_bus,
                state: Mutex::new(SchedulerState::default()),
                wake: Notify::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool; jobs scheduled earlier start running now
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(EngineError::not_initialized("scheduler has been shut down"));
            }
            state.stats.workers = self.inner.config.max_concurrent_jobs.max(1);
        }

        let count = self.inner.config.max_concurrent_jobs.max(1);
        for worker in 0..count {
            workers.push(tokio::spawn(worker_loop(self.inner.clone(), worker)));
        }
        info!(workers = count, "Scheduler started");
        Ok(())
    }

    pub async fn schedule(&self, mut job: DiscoveryJob) -> Result<JobId> {
        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            return Err(EngineError::not_initialized("scheduler has been shut down"));
        }

        let id = job.id;
        let adaptive = match job.policy {
            SchedulePolicy::Recurring { interval } => {
                let adaptive = AdaptiveInterval::new(interval, self.inner.config.adaptive.clone());
                job.current_interval = Some(adaptive.current());
                Some(adaptive)
            }
            SchedulePolicy::Once => None,
        };
        job.status = JobStatus::Pending;

        let delay = (job.next_run - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        state.queue.push(id, job.priority, Instant::now() + delay);
        debug!(job_id = %id, protocol = %job.protocol, priority = ?job.priority, "Job scheduled");

        let (outcome, _) = watch::channel(None);
        state.jobs.insert(
            id,
            JobEntry {
                job,
                adaptive,
                outcome: Arc::new(outcome),
            },
        );
        state.stats.scheduled += 1;
        drop(state);

        self.inner.wake.notify_waiters();
        Ok(id)
    }

    /// Stop future runs; an execution already in flight finishes normally
    pub async fn cancel(&self, id: JobId) -> bool {
        let mut state = self.inner.state.lock().await;
        let running = state.running.contains(&id);
        let Some(entry) = state.jobs.get_mut(&id) else {
            return false;
        };
        if entry.job.is_finished() {
            return false;
        }

        entry.job.status = JobStatus::Cancelled;
        if !running {
            let outcome = JobOutcome {
                job_id: id,
                protocol: entry.job.protocol.clone(),
                status: JobStatus::Cancelled,
                attempts: entry.job.attempts,
                result: None,
                error: None,
            };
            entry.outcome.send_replace(Some(outcome));
        }
        state.queue.remove(&id);
        state.stats.cancelled += 1;
        state.remember_finished(id);
        info!(job_id = %id, "Job cancelled");
        true
    }

    /// Queue an immediate run, still bounded by the worker pool
    pub async fn run_now(&self, id: JobId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.running.contains(&id) {
            return Ok(());
        }
        let entry = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(format!("job {id} not found")))?;
        if entry.job.status == JobStatus::Cancelled {
            return Err(EngineError::invalid_input(format!("job {id} is cancelled")));
        }

        entry.job.status = JobStatus::Pending;
        entry.job.attempts = 0;
        entry.job.next_run = Utc::now();
        let priority = entry.job.priority;
        state.finished.retain(|f| *f != id);
        state.queue.push(id, priority, Instant::now());
        drop(state);

        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Wait for the next completed run of a job.
    ///
    /// A one-shot job that already finished resolves immediately.
    pub async fn wait_for(&self, id: JobId) -> Result<JobOutcome> {
        let mut receiver = {
            let state = self.inner.state.lock().await;
            let entry = state
                .jobs
                .get(&id)
                .ok_or_else(|| EngineError::not_found(format!("job {id} not found")))?;
            if entry.job.is_finished() {
                if let Some(outcome) = entry.outcome.borrow().clone() {
                    return Ok(outcome);
                }
            }
            entry.outcome.subscribe()
        };

        loop {
            receiver
                .changed()
                .await
                .map_err(|_| EngineError::not_found(format!("job {id} was dropped")))?;
            if let Some(outcome) = receiver.borrow_and_update().clone() {
                return Ok(outcome);
            }
        }
    }

    pub async fn job(&self, id: JobId) -> Option<DiscoveryJob> {
        self.inner.state.lock().await.jobs.get(&id).map(|e| e.job.clone())
    }

    /// Every known job, most urgent first
    pub async fn list_jobs(&self) -> Vec<DiscoveryJob> {
        let mut jobs: Vec<DiscoveryJob> = self
            .inner
            .state
            .lock()
            .await
            .jobs
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.next_run.cmp(&b.next_run)));
        jobs
    }

    pub async fn get_statistics(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        let mut stats = state.stats.clone();
        stats.running = state.running.len();
        stats.pending = state.queue.len();
        stats.total_jobs = state.jobs.len();
        stats
    }

    /// Stop the workers and cancel everything still queued
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            for id in state.queue.clear() {
                if let Some(entry) = state.jobs.get_mut(&id) {
                    entry.job.status = JobStatus::Cancelled;
                    let outcome = JobOutcome {
                        job_id: id,
                        protocol: entry.job.protocol.clone(),
                        status: JobStatus::Cancelled,
                        attempts: entry.job.attempts,
                        result: None,
                        error: Some("scheduler shut down".to_string()),
                    };
                    entry.outcome.send_replace(Some(outcome));
                }
                state.stats.cancelled += 1;
            }
        }
        self.inner.wake.notify_waiters();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }
        info!("Scheduler stopped");
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    debug!(worker, "Scheduler worker started");
    loop {
        let notified = inner.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match inner.next_step().await {
            Step::Run(job) => inner.run(job).await,
            Step::Wait(Some(due)) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(due) => {}
                }
            }
            Step::Wait(None) => notified.await,
            Step::Exit => break,
        }
    }
    debug!(worker, "Scheduler worker stopped");
}

impl Inner {
    async fn next_step(&self) -> Step {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return Step::Exit;
        }
        let Some(id) = state.queue.pop_ready(Instant::now()) else {
            return Step::Wait(state.queue.next_due());
        };

        state.running.insert(id);
        match state.jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.status = JobStatus::Running;
                entry.job.attempts += 1;
                entry.job.total_attempts += 1;
                entry.job.last_run = Some(Utc::now());
                Step::Run(entry.job.clone())
            }
            None => {
                state.running.remove(&id);
                Step::Wait(Some(Instant::now()))
            }
        }
    }

    async fn run(&self, job: DiscoveryJob) {
        debug!(job_id = %job.id, protocol = %job.protocol, attempt = job.attempts, "Running job");
        let attempt = self.attempt(&job).await;
        let completion = self.complete(&job, attempt).await;
        if let Some(event) = completion.error_event {
            self.event_bus.publish(event).await;
        }
        if let Some((sender, outcome)) = completion.outcome {
            sender.send_replace(Some(outcome));
        }
        self.wake.notify_waiters();
    }

    /// One isolated, deadline-bound execution
    async fn attempt(&self, job: &DiscoveryJob) -> Attempt {
        let timeout = job.timeout.unwrap_or(self.config.job_timeout);
        let executor = self.executor.clone();
        let snapshot = job.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move { executor.execute(&snapshot).await });
        let abort = handle.abort_handle();
        let outcome = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(EngineError::job_execution(format!(
                "job for '{}' panicked: {join_error}",
                job.protocol
            ))),
            Err(_) => {
                abort.abort();
                Err(EngineError::timeout(format!(
                    "job for '{}' exceeded {timeout:?}",
                    job.protocol
                )))
            }
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) if result.success => Attempt {
                result: Some(result),
                failure: None,
                elapsed,
            },
            Ok(result) => {
                let failure = Failure {
                    message: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "discovery failed".to_string()),
                    kind: result
                        .metadata
                        .get("error_kind")
                        .and_then(|v| v.as_str())
                        .unwrap_or("protocol")
                        .to_string(),
                    recoverable: result
                        .metadata
                        .get("recoverable")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true),
                };
                Attempt {
                    result: Some(result),
                    failure: Some(failure),
                    elapsed,
                }
            }
            Err(e) => Attempt {
                result: None,
                failure: Some(Failure {
                    message: e.to_string(),
                    kind: e.category().to_string(),
                    recoverable: e.is_retryable(),
                }),
                elapsed,
            },
        }
    }

    /// Apply an attempt to the job state
    async fn complete(&self, job: &DiscoveryJob, attempt: Attempt) -> Completion {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.running.remove(&job.id);
        state.stats.total_execution_ms += attempt.elapsed.as_millis() as u64;

        let Some(entry) = state.jobs.get_mut(&job.id) else {
            return Completion::default();
        };
        let protocol = entry.job.protocol.clone();
        let attempts = entry.job.attempts;
        let cancelled = entry.job.status == JobStatus::Cancelled;

        let mut requeue = None;
        let mut completion = Completion::default();
        let mut finished = false;
        let mut completed = false;
        let mut failed = false;
        let mut retried = false;

        let status = match &attempt.failure {
            None => {
                completed = true;
                JobStatus::Succeeded
            }
            Some(failure) if !cancelled && entry.job.retry.should_retry(attempts) => {
                let delay = entry.job.retry.delay_for(attempts.saturating_sub(1));
                warn!(
                    job_id = %job.id,
                    protocol = %protocol,
                    attempt = attempts,
                    retry_in = ?delay,
                    error = %failure.message,
                    "Job attempt failed, retrying"
                );
                entry.job.last_error = Some(failure.message.clone());
                requeue = Some(delay);
                retried = true;
                JobStatus::Retrying
            }
            Some(failure) if cancelled => {
                debug!(
                    job_id = %job.id,
                    protocol = %protocol,
                    error = %failure.message,
                    "Cancelled job's last run failed"
                );
                entry.job.last_error = Some(failure.message.clone());
                JobStatus::Cancelled
            }
            Some(failure) => {
                error!(
                    job_id = %job.id,
                    protocol = %protocol,
                    attempts,
                    error = %failure.message,
                    "Job failed after exhausting retries"
                );
                entry.job.last_error = Some(failure.message.clone());
                completion.error_event = Some(
                    DiscoveryEvent::discovery_error(
                        &protocol,
                        &failure.message,
                        &failure.kind,
                        failure.recoverable,
                    )
                    .with_metadata("job_id", job.id.to_string())
                    .with_metadata("attempts", attempts),
                );
                failed = true;
                JobStatus::Failed
            }
        };

        if status != JobStatus::Retrying {
            entry.job.completed_runs += 1;
            let outcome = JobOutcome {
                job_id: job.id,
                protocol: protocol.clone(),
                status: if cancelled { JobStatus::Cancelled } else { status },
                attempts,
                result: attempt.result.clone(),
                error: attempt.failure.as_ref().map(|f| f.message.clone()),
            };
            completion.outcome = Some((entry.outcome.clone(), outcome));
            entry.job.attempts = 0;

            if cancelled {
                debug!(job_id = %job.id, "Cancelled job finished its last run");
            } else if let Some(adaptive) = entry.adaptive.as_mut() {
                let (found, new_devices) = match &attempt.result {
                    Some(result) => (
                        result.devices.len(),
                        result
                            .metadata
                            .get("new_devices")
                            .and_then(|v| v.as_u64())
                            .map(|n| n as usize)
                            .unwrap_or(result.devices.len()),
                    ),
                    None => (0, 0),
                };
                let interval = adaptive.record_run(attempt.failure.is_none(), new_devices, found);
                entry.job.current_interval = Some(interval);
                requeue = Some(interval);
                debug!(job_id = %job.id, protocol = %protocol, next_in = ?interval, "Recurring job rescheduled");
            } else {
                finished = true;
            }
        }

        if !cancelled {
            entry.job.status = match (status, requeue.is_some()) {
                (JobStatus::Retrying, _) => JobStatus::Retrying,
                (_, true) => JobStatus::Pending,
                (status, false) => status,
            };
        }

        let priority = entry.job.priority;
        if let (Some(delay), false) = (requeue, cancelled) {
            entry.job.next_run = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            state.queue.push(job.id, priority, Instant::now() + delay);
        }

        if completed {
            state.stats.completed += 1;
        }
        if failed {
            state.stats.failed += 1;
        }
        if retried {
            state.stats.retries += 1;
        }
        if finished {
            state.remember_finished(job.id);
        }
        completion
    }
}
