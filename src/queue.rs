// Bounded priority task queue
//
// Units of work execute on a fixed pool of tokio workers. Dequeue order
// is strict priority, ties broken by enqueue order. Capacity covers
// waiting plus running tasks; what happens at the limit is a per-queue
// policy. Bodies receive a cancellation token and must observe it at
// suspension points; a task whose deadline passes while queued never
// starts.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Behaviour when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPolicy {
    /// Caller waits for a slot.
    Block,
    /// Enqueue fails with QueueFull.
    RejectNew,
    /// Drop the lowest-priority waiting task; running tasks are never
    /// dropped. Falls back to QueueFull when nothing is waiting.
    ShedLow,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is at capacity")]
    QueueFull,
    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Terminal state of a task, reported through its handle and counted in
/// the queue metrics. Expiry and cancellation are lifecycle outcomes,
/// not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
    Expired,
    Dropped,
}

pub type TaskBody = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), Error>> + Send>;

struct QueuedTask {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    body: TaskBody,
    cancel: CancellationToken,
    outcome_tx: oneshot::Sender<TaskOutcome>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    // Max-heap: highest priority first, then oldest enqueue
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Handle returned by enqueue: cancel the task or await its outcome.
pub struct TaskHandle {
    cancel: CancellationToken,
    outcome_rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> TaskOutcome {
        self.outcome_rx
            .await
            .unwrap_or(TaskOutcome::Cancelled)
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
    queue_latency_us: AtomicU64,
    run_duration_us: AtomicU64,
    started: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetrics {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub dropped: u64,
    pub avg_queue_latency_us: u64,
    pub avg_run_duration_us: u64,
}

struct Inner {
    heap: BinaryHeap<QueuedTask>,
    accepting: bool,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify_worker: Notify,
    notify_space: Notify,
    capacity: usize,
    policy: FullPolicy,
    seq: AtomicU64,
    pending: AtomicUsize,
    running: AtomicUsize,
    counters: QueueCounters,
    root: CancellationToken,
    shutdown_started: AtomicBool,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create the queue and spawn `workers` worker tasks.
    pub fn start(workers: usize, capacity: usize, policy: FullPolicy) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                accepting: true,
            }),
            notify_worker: Notify::new(),
            notify_space: Notify::new(),
            capacity: capacity.max(1),
            policy,
            seq: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            counters: QueueCounters::default(),
            root: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        *queue.workers.lock().expect("worker lock poisoned") = handles;
        queue
    }

    pub fn enqueue(
        &self,
        body: TaskBody,
        priority: Priority,
    ) -> Result<TaskHandle, QueueError> {
        self.enqueue_with_deadline(body, priority, None)
    }

    pub fn enqueue_with_deadline(
        &self,
        body: TaskBody,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Result<TaskHandle, QueueError> {
        let cancel = self.root.child_token();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = QueuedTask {
            priority,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            enqueued_at: Instant::now(),
            deadline,
            body,
            cancel: cancel.clone(),
            outcome_tx,
        };

        match self.try_push(task) {
            Ok(()) => Ok(TaskHandle { cancel, outcome_rx }),
            Err((err, _task)) => Err(err),
        }
    }

    /// Like [`enqueue`], but waits for a slot when the queue is full and
    /// the policy is `Block`.
    #[allow(dead_code)] // Block is a per-queue policy choice; the default queues shed
    pub async fn enqueue_blocking(
        &self,
        body: TaskBody,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Result<TaskHandle, QueueError> {
        let cancel = self.root.child_token();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let mut task = QueuedTask {
            priority,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            enqueued_at: Instant::now(),
            deadline,
            body,
            cancel: cancel.clone(),
            outcome_tx,
        };

        loop {
            match self.try_push(task) {
                Ok(()) => return Ok(TaskHandle { cancel, outcome_rx }),
                Err((QueueError::QueueFull, Some(returned)))
                    if self.policy == FullPolicy::Block =>
                {
                    task = returned;
                    // The periodic re-check covers a wakeup lost between
                    // the failed push and this await
                    tokio::select! {
                        _ = self.notify_space.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    }
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.load(Ordering::SeqCst) + self.running.load(Ordering::SeqCst)
    }

    /// Push, honouring the full-queue policy. On QueueFull the task is
    /// handed back so a blocking caller can retry without losing it.
    fn try_push(&self, task: QueuedTask) -> Result<(), (QueueError, Option<QueuedTask>)> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if !inner.accepting {
            return Err((QueueError::ShuttingDown, Some(task)));
        }
        if self.in_flight() >= self.capacity {
            match self.policy {
                FullPolicy::RejectNew | FullPolicy::Block => {
                    return Err((QueueError::QueueFull, Some(task)));
                }
                FullPolicy::ShedLow => {
                    if !Self::shed_lowest(&mut inner, &self.counters) {
                        return Err((QueueError::QueueFull, Some(task)));
                    }
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        inner.heap.push(task);
        self.pending.fetch_add(1, Ordering::SeqCst);
        drop(inner);
        self.notify_worker.notify_one();
        Ok(())
    }

    /// Remove the lowest-priority, youngest waiting task. Returns false
    /// when nothing is waiting.
    fn shed_lowest(inner: &mut Inner, counters: &QueueCounters) -> bool {
        if inner.heap.is_empty() {
            return false;
        }
        let mut tasks: Vec<QueuedTask> = inner.heap.drain().collect();
        let victim_idx = tasks
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(i, _)| i)
            .expect("nonempty");
        let victim = tasks.swap_remove(victim_idx);
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        let _ = victim.outcome_tx.send(TaskOutcome::Dropped);
        for task in tasks {
            inner.heap.push(task);
        }
        true
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let task = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                match inner.heap.pop() {
                    Some(task) => {
                        // The popped task counts as running from inside the
                        // critical section, so pending + running never
                        // undercounts against capacity
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        self.running.fetch_add(1, Ordering::SeqCst);
                        Some(task)
                    }
                    None if !inner.accepting => return,
                    None => None,
                }
            };

            let Some(task) = task else {
                self.notify_worker.notified().await;
                continue;
            };

            if let Some(deadline) = task.deadline {
                if Instant::now() > deadline {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    let _ = task.outcome_tx.send(TaskOutcome::Expired);
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    self.notify_space.notify_waiters();
                    continue;
                }
            }
            if task.cancel.is_cancelled() {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = task.outcome_tx.send(TaskOutcome::Cancelled);
                self.running.fetch_sub(1, Ordering::SeqCst);
                self.notify_space.notify_waiters();
                continue;
            }

            self.counters.started.fetch_add(1, Ordering::Relaxed);
            self.counters.queue_latency_us.fetch_add(
                task.enqueued_at.elapsed().as_micros() as u64,
                Ordering::Relaxed,
            );

            let started = Instant::now();
            let result = (task.body)(task.cancel.clone()).await;
            self.counters
                .run_duration_us
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

            let outcome = if task.cancel.is_cancelled() {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::Cancelled
            } else {
                match result {
                    Ok(()) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        TaskOutcome::Completed
                    }
                    Err(e) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("worker {worker_id}: task failed: {e}");
                        TaskOutcome::Failed(e.to_string())
                    }
                }
            };
            let _ = task.outcome_tx.send(outcome);

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.notify_space.notify_waiters();
        }
    }

    /// Stop accepting work, wait up to `grace` for in-flight tasks, then
    /// cancel the remainder. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.accepting = false;
        }
        self.notify_worker.notify_waiters();

        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if self.in_flight() > 0 {
            tracing::warn!(
                "queue shutdown grace expired with {} tasks in flight, cancelling",
                self.in_flight()
            );
            self.root.cancel();
            // Drain anything still waiting
            let drained: Vec<QueuedTask> = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                inner.heap.drain().collect()
            };
            for task in drained {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = task.outcome_tx.send(TaskOutcome::Cancelled);
            }
        }

        self.notify_worker.notify_waiters();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("worker lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        let started = self.counters.started.load(Ordering::Relaxed).max(1);
        QueueMetrics {
            pending: self.pending.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            avg_queue_latency_us: self.counters.queue_latency_us.load(Ordering::Relaxed) / started,
            avg_run_duration_us: self.counters.run_duration_us.load(Ordering::Relaxed) / started,
        }
    }
}
