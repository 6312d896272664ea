//! Bounded queue: at most `max_concurrent` tasks run at once, the rest wait
//! in FIFO order until a slot frees up, the wait list fills, or they time out.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::model::{QueuePosition, QueueSnapshot};

/// Weight of the newest sample in the rolling task-duration average.
const DURATION_SMOOTHING: f64 = 0.2;

type Settle<T, E> = oneshot::Sender<Result<T, QueueError<E>>>;

/// A task admitted but not yet started.
struct WaitingEntry<T, E> {
    request_id: String,
    task: BoxFuture<'static, Result<T, E>>,
    done: Settle<T, E>,
    enqueued_at: Instant,
    timer: JoinHandle<()>,
}

struct QueueState<T, E> {
    /// Request id -> start time, for every running task.
    active: HashMap<String, Instant>,
    waiting: VecDeque<WaitingEntry<T, E>>,
    average_duration: Duration,
}

/// How a task was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Took a free slot immediately.
    Started,
    /// Appended to the wait list at this 1-indexed position.
    Queued { position: usize },
}

/// Handle to an admitted task. Dropping it does not cancel the task.
pub struct Ticket<T, E> {
    request_id: String,
    admission: Admission,
    rx: oneshot::Receiver<Result<T, QueueError<E>>>,
}

impl<T, E> Ticket<T, E> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// Wait for the task to settle.
    pub async fn outcome(self) -> Result<T, QueueError<E>> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Closed {
                request_id: self.request_id,
            }),
        }
    }
}

/// Admission-controlled executor for async tasks within one process.
pub struct BoundedQueue<T, E> {
    config: QueueConfig,
    state: Mutex<QueueState<T, E>>,
    next_id: AtomicU64,
}

impl<T, E> BoundedQueue<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let average_duration = config.average_task_duration;
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState {
                active: HashMap::new(),
                waiting: VecDeque::new(),
                average_duration,
            }),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req_{}_{}", chrono::Utc::now().timestamp_millis(), n)
    }

    /// Run `task` and wait for its result, returning it with the request id.
    pub async fn submit<F>(
        self: &Arc<Self>,
        task: F,
        timeout: Duration,
    ) -> Result<(T, String), QueueError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let ticket = self.admit(task, timeout).await?;
        let request_id = ticket.request_id.clone();
        let result = ticket.outcome().await?;
        Ok((result, request_id))
    }

    /// Admit `task`: start it now if a slot is free, otherwise queue it for at
    /// most `timeout`. Fails with `QueueError::Full` without side effects when
    /// the wait list is at capacity.
    pub async fn admit<F>(
        self: &Arc<Self>,
        task: F,
        timeout: Duration,
    ) -> Result<Ticket<T, E>, QueueError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock().await;

        if state.waiting.len() >= self.config.max_queue_size {
            let stats = self.snapshot(&state);
            warn!(
                request_id = %request_id,
                queue_length = stats.queue_length,
                "Queue full, rejecting request"
            );
            return Err(QueueError::Full { stats });
        }

        if state.active.len() < self.config.max_concurrent {
            self.start(&mut state, request_id.clone(), task.boxed(), tx);
            return Ok(Ticket {
                request_id,
                admission: Admission::Started,
                rx,
            });
        }

        let timer = self.spawn_timer(request_id.clone(), timeout);
        state.waiting.push_back(WaitingEntry {
            request_id: request_id.clone(),
            task: task.boxed(),
            done: tx,
            enqueued_at: Instant::now(),
            timer,
        });
        let position = state.waiting.len();

        info!(request_id = %request_id, position, "Request queued");

        Ok(Ticket {
            request_id,
            admission: Admission::Queued { position },
            rx,
        })
    }

    /// Promote the head of the wait list if a slot is free. Returns whether a
    /// task was started.
    pub async fn drain(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        self.drain_locked(&mut state)
    }

    /// Current slot and wait-list statistics.
    pub async fn stats(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        self.snapshot(&state)
    }

    /// Where `request_id` stands, or `None` once it settled or if unknown.
    pub async fn position(&self, request_id: &str) -> Option<QueuePosition> {
        let state = self.state.lock().await;

        if state.active.contains_key(request_id) {
            return Some(QueuePosition::processing(state.waiting.len()));
        }

        let index = state
            .waiting
            .iter()
            .position(|entry| entry.request_id == request_id)?;

        Some(QueuePosition::queued(
            index,
            state.waiting.len(),
            self.config.max_concurrent,
            state.active.len(),
            state.average_duration,
        ))
    }

    /// Number of tasks holding a slot.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    fn snapshot(&self, state: &QueueState<T, E>) -> QueueSnapshot {
        QueueSnapshot {
            active_count: state.active.len(),
            queue_length: state.waiting.len(),
            max_concurrent: self.config.max_concurrent,
            max_queue_size: self.config.max_queue_size,
            total_analyses: None,
            workers: None,
        }
    }

    /// Claim a slot and run `task` on its own tokio task. The slot is released
    /// and the wait list drained before the caller is settled, whatever the
    /// outcome.
    fn start(
        self: &Arc<Self>,
        state: &mut QueueState<T, E>,
        request_id: String,
        task: BoxFuture<'static, Result<T, E>>,
        done: Settle<T, E>,
    ) {
        state.active.insert(request_id.clone(), Instant::now());
        debug!(request_id = %request_id, active = state.active.len(), "Request started");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            queue.finish(&request_id, started.elapsed()).await;

            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(QueueError::Task(e)),
                Err(_) => {
                    warn!(request_id = %request_id, "Task panicked");
                    Err(QueueError::Panicked { request_id })
                }
            };
            // Caller may have stopped waiting.
            let _ = done.send(result);
        });
    }

    async fn finish(self: &Arc<Self>, request_id: &str, elapsed: Duration) {
        let mut state = self.state.lock().await;
        state.active.remove(request_id);
        state.average_duration = state
            .average_duration
            .mul_f64(1.0 - DURATION_SMOOTHING)
            + elapsed.mul_f64(DURATION_SMOOTHING);

        debug!(
            request_id = %request_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request finished"
        );

        self.drain_locked(&mut state);
    }

    fn drain_locked(self: &Arc<Self>, state: &mut QueueState<T, E>) -> bool {
        if state.active.len() >= self.config.max_concurrent {
            return false;
        }
        let Some(entry) = state.waiting.pop_front() else {
            return false;
        };

        entry.timer.abort();
        info!(
            request_id = %entry.request_id,
            waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
            remaining = state.waiting.len(),
            "Dequeued request"
        );

        self.start(state, entry.request_id, entry.task, entry.done);
        true
    }

    fn spawn_timer(self: &Arc<Self>, request_id: String, timeout: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.evict(&request_id).await;
        })
    }

    /// Remove a still-waiting entry and fail its caller with a timeout.
    async fn evict(&self, request_id: &str) {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(index) = state
                .waiting
                .iter()
                .position(|entry| entry.request_id == request_id)
            else {
                return;
            };
            state.waiting.remove(index)
        };

        if let Some(entry) = entry {
            let waited = entry.enqueued_at.elapsed();
            info!(
                request_id = %request_id,
                waited_ms = waited.as_millis() as u64,
                "Request timed out in queue"
            );
            let _ = entry.done.send(Err(QueueError::Timeout {
                request_id: entry.request_id,
                waited,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::model::PositionStatus;

    const LONG: Duration = Duration::from_secs(10);

    type TestQueue = BoundedQueue<u32, String>;

    fn queue(max_concurrent: usize, max_queue_size: usize) -> Arc<TestQueue> {
        BoundedQueue::new(QueueConfig {
            max_concurrent,
            max_queue_size,
            ..QueueConfig::default()
        })
    }

    /// A task that completes with `value` once the returned sender fires.
    fn gated(value: u32) -> (oneshot::Sender<()>, impl Future<Output = Result<u32, String>>) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
            Ok(value)
        })
    }

    #[tokio::test]
    async fn admits_queues_and_rejects_in_order() {
        let queue = queue(1, 2);

        let (release_a, task_a) = gated(1);
        let (release_b, task_b) = gated(2);
        let (release_c, task_c) = gated(3);

        let a = queue.admit(task_a, LONG).await.unwrap();
        let b = queue.admit(task_b, LONG).await.unwrap();
        let c = queue.admit(task_c, LONG).await.unwrap();

        assert_eq!(a.admission(), Admission::Started);
        assert_eq!(b.admission(), Admission::Queued { position: 1 });
        assert_eq!(c.admission(), Admission::Queued { position: 2 });

        let pos_a = queue.position(a.request_id()).await.unwrap();
        assert_eq!(pos_a.status, PositionStatus::Processing);
        assert_eq!(queue.position(c.request_id()).await.unwrap().position, 2);

        let before = queue.stats().await;
        let d = queue.admit(async { Ok(4) }, LONG).await;
        assert!(matches!(d, Err(QueueError::Full { .. })));
        assert_eq!(queue.stats().await, before);

        release_a.send(()).unwrap();
        assert_eq!(a.outcome().await.unwrap(), 1);

        let pos_b = queue.position(b.request_id()).await.unwrap();
        assert_eq!(pos_b.status, PositionStatus::Processing);
        let pos_c = queue.position(c.request_id()).await.unwrap();
        assert_eq!(pos_c.status, PositionStatus::Queued);
        assert_eq!(pos_c.position, 1);

        release_b.send(()).unwrap();
        release_c.send(()).unwrap();
        assert_eq!(b.outcome().await.unwrap(), 2);
        assert_eq!(c.outcome().await.unwrap(), 3);

        let stats = queue.stats().await;
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.queue_length, 0);
    }

    #[tokio::test]
    async fn queued_request_times_out_exactly_once() {
        let queue = queue(1, 2);
        let (_hold, blocker) = gated(1);
        let _running = queue.admit(blocker, LONG).await.unwrap();

        let waiting = queue
            .admit(async { Ok(2) }, Duration::from_millis(100))
            .await
            .unwrap();
        let request_id = waiting.request_id().to_string();
        assert_eq!(queue.stats().await.queue_length, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        match waiting.outcome().await {
            Err(QueueError::Timeout { request_id: id, waited }) => {
                assert_eq!(id, request_id);
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(queue.stats().await.queue_length, 0);
        assert!(queue.position(&request_id).await.is_none());
    }

    #[tokio::test]
    async fn timed_out_entry_does_not_block_later_ones() {
        let queue = queue(1, 3);
        let (release, blocker) = gated(1);
        let first = queue.admit(blocker, LONG).await.unwrap();

        let short = queue
            .admit(async { Ok(2) }, Duration::from_millis(30))
            .await
            .unwrap();
        let patient = queue.admit(async { Ok(3) }, LONG).await.unwrap();

        assert!(matches!(
            short.outcome().await,
            Err(QueueError::Timeout { .. })
        ));
        assert_eq!(queue.position(patient.request_id()).await.unwrap().position, 1);

        release.send(()).unwrap();
        assert_eq!(first.outcome().await.unwrap(), 1);
        assert_eq!(patient.outcome().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn task_error_passes_through_and_frees_slot() {
        let queue = queue(1, 1);
        let result = queue
            .submit(async { Err::<u32, _>("analysis failed".to_string()) }, LONG)
            .await;

        match result {
            Err(QueueError::Task(e)) => assert_eq!(e, "analysis failed"),
            other => panic!("expected task error, got {other:?}"),
        }
        assert_eq!(queue.active_count().await, 0);

        let (value, request_id) = queue.submit(async { Ok(7) }, LONG).await.unwrap();
        assert_eq!(value, 7);
        assert!(request_id.starts_with("req_"));
    }

    #[tokio::test]
    async fn panicking_task_frees_slot_and_drains() {
        let queue = queue(1, 1);
        let (release, task) = gated(0);
        let panicking = queue
            .admit(
                async move {
                    let value = task.await?;
                    if value == 0 {
                        panic!("analyzer crashed");
                    }
                    Ok(value)
                },
                LONG,
            )
            .await
            .unwrap();
        let next = queue.admit(async { Ok(5) }, LONG).await.unwrap();

        release.send(()).unwrap();
        assert!(matches!(
            panicking.outcome().await,
            Err(QueueError::Panicked { .. })
        ));
        assert_eq!(next.outcome().await.unwrap(), 5);
        assert_eq!(queue.active_count().await, 0);
    }

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let queue = queue(1, 10);
        let order = Arc::new(Mutex::new(Vec::new()));

        let (release, blocker) = gated(0);
        let first = queue.admit(blocker, LONG).await.unwrap();

        let mut tickets = Vec::new();
        for i in 1..=5u32 {
            let order = Arc::clone(&order);
            let ticket = queue
                .admit(
                    async move {
                        order.lock().await.push(i);
                        Ok(i)
                    },
                    LONG,
                )
                .await
                .unwrap();
            tickets.push(ticket);
        }

        release.send(()).unwrap();
        first.outcome().await.unwrap();
        for ticket in tickets {
            ticket.outcome().await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let queue = queue(2, 10);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tickets = Vec::new();
        for i in 0..8u32 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let ticket = queue
                .admit(
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    },
                    LONG,
                )
                .await
                .unwrap();
            tickets.push(ticket);
        }

        for ticket in tickets {
            ticket.outcome().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn estimated_wait_is_monotonic_in_position() {
        let queue = queue(1, 5);
        let (_hold, blocker) = gated(0);
        let _running = queue.admit(blocker, LONG).await.unwrap();

        let mut waits = Vec::new();
        let mut tickets = Vec::new();
        for i in 0..3u32 {
            tickets.push(queue.admit(async move { Ok(i) }, LONG).await.unwrap());
        }
        for ticket in &tickets {
            let pos = queue.position(ticket.request_id()).await.unwrap();
            waits.push(pos.estimated_wait_ms);
        }

        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        assert!(waits[0] < waits[2]);
    }

    #[tokio::test]
    async fn unknown_request_has_no_position() {
        let queue = queue(1, 1);
        assert!(queue.position("req_0_0").await.is_none());
        assert!(!queue.drain().await);
    }
}
