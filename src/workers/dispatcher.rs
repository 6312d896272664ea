//! Dispatcher: FIFO job queue over a discovered worker pool.
//!
//! Each worker runs one job at a time, so the pool size is the concurrency
//! limit. Jobs go to the first idle worker in directory order; the rest wait
//! (bounded by `max_queue_size` and `queue_timeout`) and are drained one at a
//! time whenever a worker is released, either by its call completing or by
//! the health reconciler.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{WorkerClient, WorkerHealth};
use super::directory::{WorkerDirectory, WorkerPool};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, WorkerCallError};
use crate::model::{
    AnalysisRequest, CurrentJob, Job, JobState, QueuePosition, QueueSnapshot, WorkerRecord,
};

/// Weight of the newest sample in the rolling job-duration average.
const DURATION_SMOOTHING: f64 = 0.2;

type Settle = oneshot::Sender<Result<JobOutcome, DispatchError>>;

/// Bookkeeping appended to every successful result as `queueStats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReceipt {
    pub job_id: String,
    pub worker_id: usize,
    pub queued_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// A settled, successful job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The worker's response body, untouched.
    pub result: Value,
    pub receipt: JobReceipt,
}

impl JobOutcome {
    /// The worker's result with `queueStats` merged in.
    pub fn into_body(self) -> Value {
        let receipt = serde_json::to_value(&self.receipt).unwrap_or(Value::Null);
        match self.result {
            Value::Object(mut map) => {
                map.insert("queueStats".to_string(), receipt);
                Value::Object(map)
            }
            other => serde_json::json!({ "result": other, "queueStats": receipt }),
        }
    }
}

/// Where a job went at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Dispatched { worker_id: usize },
    Queued { position: usize },
}

/// Handle to a submitted job. Dropping it does not cancel the job.
pub struct JobTicket {
    job_id: String,
    placement: Placement,
    rx: oneshot::Receiver<Result<JobOutcome, DispatchError>>,
}

impl JobTicket {
    /// Id used for position lookups and in the receipt.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Wait for the job to settle.
    pub async fn outcome(self) -> Result<JobOutcome, DispatchError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Closed {
                job_id: self.job_id,
            }),
        }
    }
}

/// What a health report changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    /// Believed idle, reported busy: marked busy with the reported job.
    Adopted,
    /// Believed busy, reported idle: released, and the next job drained.
    Released { drained: bool },
    /// The worker's job changed while the probe was in flight; report ignored.
    Stale,
    /// No longer in the pool.
    UnknownWorker,
}

struct QueuedJob {
    job: Job,
    done: Settle,
    enqueued_at: Instant,
    timer: JoinHandle<()>,
}

struct DispatchState {
    pool: WorkerPool,
    waiting: VecDeque<QueuedJob>,
    average_duration: Duration,
}

pub struct Dispatcher {
    config: DispatchConfig,
    directory: WorkerDirectory,
    client: Arc<dyn WorkerClient>,
    state: Mutex<DispatchState>,
    total_analyses: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher with an empty pool; the first admission discovers it.
    pub fn new(
        config: DispatchConfig,
        directory: WorkerDirectory,
        client: Arc<dyn WorkerClient>,
    ) -> Arc<Self> {
        let average_duration = config.average_job_duration;
        Arc::new(Self {
            config,
            directory,
            client,
            state: Mutex::new(DispatchState {
                pool: WorkerPool::new(),
                waiting: VecDeque::new(),
                average_duration,
            }),
            total_analyses: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The client used for analyze calls, shared with the health reconciler.
    pub fn client(&self) -> Arc<dyn WorkerClient> {
        Arc::clone(&self.client)
    }

    /// Re-resolve the pool and return the resulting records. Workers that
    /// joined take waiting jobs straight away.
    pub async fn refresh_workers(self: &Arc<Self>) -> Vec<WorkerRecord> {
        let discovered = self.directory.discover().await;
        let mut state = self.state.lock().await;
        self.apply_discovery(&mut state, discovered);
        state.pool.records().to_vec()
    }

    /// Submit a job and wait for it to settle.
    pub async fn submit(
        self: &Arc<Self>,
        request: AnalysisRequest,
    ) -> Result<JobOutcome, DispatchError> {
        self.enqueue(request).await?.outcome().await
    }

    /// Admit a job: dispatch it to an idle worker when nothing is waiting,
    /// otherwise queue it behind the jobs already waiting. Rejects with
    /// `NoWorkersAvailable` on an empty pool and `QueueFull` when the wait list
    /// is at capacity, in both cases before claiming anything.
    pub async fn enqueue(
        self: &Arc<Self>,
        request: AnalysisRequest,
    ) -> Result<JobTicket, DispatchError> {
        let discovered = self.directory.discover().await;

        let mut state = self.state.lock().await;
        self.apply_discovery(&mut state, discovered);

        if state.pool.is_empty() {
            warn!(service = %self.directory.service_name(), "No workers available");
            return Err(DispatchError::NoWorkersAvailable);
        }

        let job = Job::new(request);
        let job_id = job.id.clone();
        let (tx, rx) = oneshot::channel();

        if state.waiting.is_empty() && state.pool.first_idle_mut().is_some() {
            let worker_id = self.start(&mut state, job, tx);
            return Ok(JobTicket {
                job_id,
                placement: Placement::Dispatched { worker_id },
                rx,
            });
        }

        if state.waiting.len() >= self.config.max_queue_size {
            let stats = self.snapshot(&state);
            warn!(job_id = %job_id, queue_length = stats.queue_length, "Queue full, rejecting job");
            return Err(DispatchError::QueueFull { stats });
        }

        let timer = self.spawn_timer(job_id.clone());
        state.waiting.push_back(QueuedJob {
            job,
            done: tx,
            enqueued_at: Instant::now(),
            timer,
        });
        let position = state.waiting.len();

        info!(job_id = %job_id, position, "All workers busy, job queued");

        Ok(JobTicket {
            job_id,
            placement: Placement::Queued { position },
            rx,
        })
    }

    /// Hand the head of the queue to an idle worker, if both exist.
    pub async fn drain_next(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        self.drain_locked(&mut state)
    }

    /// Fold a worker's self-report into the pool. A busy→idle flip drains the
    /// next job through the same path as a completed call.
    ///
    /// `probed` is the worker's job when the probe was sent. If the worker has
    /// since been released or handed another job, the report is stale and is
    /// ignored.
    pub async fn apply_health(
        self: &Arc<Self>,
        address: &str,
        probed: Option<&CurrentJob>,
        health: &WorkerHealth,
    ) -> HealthTransition {
        let mut state = self.state.lock().await;

        let Some(worker) = state.pool.get_mut(address) else {
            return HealthTransition::UnknownWorker;
        };

        if worker.current_job.as_ref() != probed {
            debug!(
                worker = worker.id,
                address = %address,
                "Worker changed during probe, ignoring report"
            );
            return HealthTransition::Stale;
        }

        match (worker.busy, health.busy) {
            (false, true) => {
                worker.busy = true;
                worker.current_job = health.current_analysis.clone().map(CurrentJob::Reported);
                info!(worker = worker.id, address = %address, "Worker reports busy, adopting its job");
                HealthTransition::Adopted
            }
            (true, false) => {
                info!(
                    worker = worker.id,
                    address = %address,
                    job_id = worker.current_job.as_ref().and_then(|j| j.job_id()).unwrap_or("-"),
                    "Worker reports idle, releasing"
                );
                worker.busy = false;
                worker.current_job = None;
                let drained = self.drain_locked(&mut state);
                HealthTransition::Released { drained }
            }
            _ => HealthTransition::Unchanged,
        }
    }

    /// Current pool and wait-list statistics.
    pub async fn stats(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        self.snapshot(&state)
    }

    /// Where `job_id` stands, or `None` once it settled or if unknown.
    pub async fn position(&self, job_id: &str) -> Option<QueuePosition> {
        let state = self.state.lock().await;

        let running = state
            .pool
            .records()
            .iter()
            .any(|w| w.current_job.as_ref().and_then(|j| j.job_id()) == Some(job_id));
        if running {
            return Some(QueuePosition::processing(state.waiting.len()));
        }

        let index = state.waiting.iter().position(|q| q.job.id == job_id)?;
        Some(QueuePosition::queued(
            index,
            state.waiting.len(),
            state.pool.len(),
            state.pool.busy_count(),
            state.average_duration,
        ))
    }

    fn snapshot(&self, state: &DispatchState) -> QueueSnapshot {
        QueueSnapshot {
            active_count: state.pool.busy_count(),
            queue_length: state.waiting.len(),
            max_concurrent: state.pool.len(),
            max_queue_size: self.config.max_queue_size,
            total_analyses: Some(self.total_analyses.load(Ordering::Relaxed)),
            workers: Some(state.pool.records().to_vec()),
        }
    }

    /// Fold a discovery result into the pool, then fill any workers that
    /// joined from the head of the wait list.
    fn apply_discovery(
        self: &Arc<Self>,
        state: &mut DispatchState,
        discovered: Option<Vec<String>>,
    ) {
        let change = self.directory.apply(&mut state.pool, discovered);
        if change.added.is_empty() {
            return;
        }
        let mut drained = 0;
        while self.drain_locked(state) {
            drained += 1;
        }
        if drained > 0 {
            info!(drained, added = change.added.len(), "New workers took waiting jobs");
        }
    }

    fn drain_locked(self: &Arc<Self>, state: &mut DispatchState) -> bool {
        if state.waiting.is_empty() || state.pool.first_idle_mut().is_none() {
            return false;
        }
        let Some(queued) = state.waiting.pop_front() else {
            return false;
        };

        queued.timer.abort();
        info!(
            job_id = %queued.job.id,
            waited_ms = queued.enqueued_at.elapsed().as_millis() as u64,
            remaining = state.waiting.len(),
            "Dequeued job"
        );

        self.start(state, queued.job, queued.done);
        true
    }

    /// Mark the first idle worker busy with `job` and issue the remote call on
    /// its own task. Callers must have checked that an idle worker exists.
    /// Returns the worker's id.
    fn start(self: &Arc<Self>, state: &mut DispatchState, mut job: Job, done: Settle) -> usize {
        let Some(worker) = state.pool.first_idle_mut() else {
            // Unreachable given the callers' checks; fail the job rather than lose it.
            let _ = done.send(Err(DispatchError::NoWorkersAvailable));
            return 0;
        };

        worker.busy = true;
        worker.current_job = Some(CurrentJob::Dispatched(job.summary()));
        let worker_id = worker.id;
        let address = worker.address.clone();
        advance(&mut job, JobState::Running);

        info!(
            job_id = %job.id,
            worker = worker_id,
            url = %job.request.target,
            mode = %job.request.mode,
            "Dispatching job"
        );

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let call_timeout = dispatcher.config.call_timeout;
            let call = tokio::time::timeout(
                call_timeout,
                dispatcher.client.analyze(&address, &job.request, call_timeout),
            );

            let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(WorkerCallError::Timeout {
                    address: address.clone(),
                    timeout: call_timeout,
                }),
                Err(_) => Err(WorkerCallError::Transport {
                    address: address.clone(),
                    reason: "worker client panicked".to_string(),
                }),
            };

            dispatcher.complete(&address, &job.id, started.elapsed()).await;

            let result = match outcome {
                Ok(result) => {
                    advance(&mut job, JobState::Done);
                    dispatcher.total_analyses.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = %job.id, worker = worker_id, "Job completed");
                    Ok(JobOutcome {
                        result,
                        receipt: JobReceipt {
                            job_id: job.id.clone(),
                            worker_id,
                            queued_at: job.created_at,
                            completed_at: Utc::now(),
                        },
                    })
                }
                Err(source) => {
                    advance(&mut job, JobState::Failed);
                    warn!(job_id = %job.id, worker = worker_id, error = %source, "Job failed");
                    Err(DispatchError::WorkerCallFailed {
                        job_id: job.id.clone(),
                        worker_id,
                        source,
                    })
                }
            };
            let _ = done.send(result);
        });

        worker_id
    }

    /// Release the worker that ran `job_id` and drain. A worker already
    /// released (by the reconciler) or reassigned to another job is left alone.
    async fn complete(self: &Arc<Self>, address: &str, job_id: &str, elapsed: Duration) {
        let mut state = self.state.lock().await;

        match state.pool.get_mut(address) {
            Some(worker) if worker.current_job.as_ref().and_then(|j| j.job_id()) == Some(job_id) => {
                worker.busy = false;
                worker.current_job = None;
            }
            Some(_) => debug!(job_id = %job_id, address = %address, "Worker already released"),
            None => debug!(job_id = %job_id, address = %address, "Worker left the pool mid-job"),
        }

        state.average_duration = state
            .average_duration
            .mul_f64(1.0 - DURATION_SMOOTHING)
            + elapsed.mul_f64(DURATION_SMOOTHING);

        self.drain_locked(&mut state);
    }

    fn spawn_timer(self: &Arc<Self>, job_id: String) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let timeout = self.config.queue_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            dispatcher.evict(&job_id).await;
        })
    }

    /// Drop a still-waiting job and fail its caller. Worker state is untouched.
    async fn evict(&self, job_id: &str) {
        let queued = {
            let mut state = self.state.lock().await;
            let Some(index) = state.waiting.iter().position(|q| q.job.id == job_id) else {
                return;
            };
            state.waiting.remove(index)
        };

        if let Some(mut queued) = queued {
            let waited = queued.enqueued_at.elapsed();
            advance(&mut queued.job, JobState::TimedOut);
            info!(job_id = %job_id, waited_ms = waited.as_millis() as u64, "Job timed out in queue");
            let _ = queued.done.send(Err(DispatchError::QueueTimeout {
                job_id: job_id.to_string(),
                waited,
            }));
        }
    }
}

fn advance(job: &mut Job, to: JobState) {
    let moved = job.transition_to(to);
    debug_assert!(moved.is_ok(), "job {}: {moved:?}", job.id);
}

/// Spawn a background task that periodically re-resolves the worker pool.
pub fn spawn_discovery_ticker(dispatcher: Arc<Dispatcher>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let workers = dispatcher.refresh_workers().await;
            debug!(workers = workers.len(), "Worker discovery pass");
        }
    })
}
