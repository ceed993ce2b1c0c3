// Poll scheduler
//
// Drives named periodic jobs with controlled skew. The scheduler never
// runs a body itself: at next_due it enqueues an invocation into the
// task queue and watches the outcome. At most one invocation of a job
// is in flight at any time; when a body overruns its interval the
// following instant is computed from completion, not from nominal time,
// so due instants are never coalesced into multiple enqueues.
//
// A job that fails K times in a row is disabled until explicitly
// re-enabled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::queue::{Priority, TaskOutcome, TaskQueue};

/// Consecutive failures before a job is disabled.
const DISABLE_AFTER: u32 = 5;
/// Smoothing factor for the duration EWMA.
const EWMA_ALPHA: f64 = 0.3;

pub type JobBody =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Scheduled,
    Queued,
    Running,
    Disabled,
}

struct JobEntry {
    interval: Duration,
    jitter: f64,
    priority: Priority,
    body: JobBody,
    next_due: Instant,
    in_flight: bool,
    state: JobState,
    last_duration: Option<Duration>,
    last_error: Option<String>,
    consecutive_failures: u32,
    ewma_duration_us: Option<f64>,
    runs: u64,
}

/// Per-job metrics snapshot.
#[derive(Debug, Clone)]
pub struct JobMetrics {
    pub state: JobState,
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub average_duration_ewma: Option<Duration>,
    pub runs: u64,
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobEntry>>,
    queue: Arc<TaskQueue>,
    notify: Notify,
}

impl Scheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            queue,
            notify: Notify::new(),
        })
    }

    /// Register a periodic job. Names are unique; re-registration
    /// replaces the previous definition.
    pub fn register(
        &self,
        name: &str,
        interval: Duration,
        body: JobBody,
        priority: Priority,
        jitter: f64,
    ) {
        let jitter = jitter.clamp(0.0, 0.999);
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        let next_due = Instant::now() + jittered(interval, jitter);
        jobs.insert(
            name.to_string(),
            JobEntry {
                interval,
                jitter,
                priority,
                body,
                next_due,
                in_flight: false,
                state: JobState::Scheduled,
                last_duration: None,
                last_error: None,
                consecutive_failures: 0,
                ewma_duration_us: None,
                runs: 0,
            },
        );
        drop(jobs);
        self.notify.notify_one();
    }

    /// Bring a job's next instant forward to now.
    #[allow(dead_code)] // Operator run-now endpoint
    pub fn trigger(&self, name: &str) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if let Some(entry) = jobs.get_mut(name) {
            if entry.state != JobState::Disabled {
                entry.next_due = Instant::now();
            }
        }
        drop(jobs);
        self.notify.notify_one();
    }

    /// Re-enable a job disabled by consecutive failures.
    pub fn enable(&self, name: &str) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if let Some(entry) = jobs.get_mut(name) {
            if entry.state == JobState::Disabled {
                entry.state = JobState::Scheduled;
                entry.consecutive_failures = 0;
                entry.next_due = Instant::now() + jittered(entry.interval, entry.jitter);
            }
        }
        drop(jobs);
        self.notify.notify_one();
    }

    /// Replace a job's interval, keeping its body and metrics. Used by
    /// the adaptive GPS polling loop.
    pub fn set_interval(&self, name: &str, interval: Duration) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if let Some(entry) = jobs.get_mut(name) {
            if entry.interval != interval {
                entry.interval = interval;
                if !entry.in_flight && entry.state != JobState::Disabled {
                    entry.next_due = Instant::now() + jittered(interval, entry.jitter);
                }
            }
        }
        drop(jobs);
        self.notify.notify_one();
    }

    pub fn metrics(&self) -> HashMap<String, JobMetrics> {
        let jobs = self.jobs.lock().expect("scheduler lock poisoned");
        jobs.iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    JobMetrics {
                        state: entry.state,
                        last_duration: entry.last_duration,
                        last_error: entry.last_error.clone(),
                        consecutive_failures: entry.consecutive_failures,
                        average_duration_ewma: entry
                            .ewma_duration_us
                            .map(|us| Duration::from_micros(us as u64)),
                        runs: entry.runs,
                    },
                )
            })
            .collect()
    }

    /// Main loop. Returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let sleep_for = Self::dispatch_due(&self);

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("scheduler loop stopping");
                    return;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Enqueue every due job; returns how long to sleep until the next
    /// instant.
    fn dispatch_due(this: &Arc<Self>) -> Duration {
        let now = Instant::now();
        let mut due: Vec<(String, JobBody, Priority)> = Vec::new();
        let mut earliest: Option<Instant> = None;

        {
            let mut jobs = this.jobs.lock().expect("scheduler lock poisoned");
            for (name, entry) in jobs.iter_mut() {
                if entry.state == JobState::Disabled || entry.in_flight {
                    continue;
                }
                if entry.next_due <= now {
                    entry.in_flight = true;
                    entry.state = JobState::Queued;
                    due.push((name.clone(), entry.body.clone(), entry.priority));
                } else {
                    earliest = Some(match earliest {
                        Some(t) if t < entry.next_due => t,
                        _ => entry.next_due,
                    });
                }
            }
        }

        for (name, body, priority) in due {
            this.clone().launch(name, body, priority);
        }

        earliest
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(1))
    }

    fn launch(self: Arc<Self>, name: String, body: JobBody, priority: Priority) {
        let scheduler = self.clone();
        let job_name = name.clone();

        // Wrap the body so run state and duration are recorded from
        // inside the worker
        let wrapped: crate::queue::TaskBody = Box::new(move |token| {
            Box::pin(async move {
                scheduler.mark_running(&job_name);
                let start = Instant::now();
                let result = body(token).await;
                scheduler.record_duration(&job_name, start.elapsed());
                result
            })
        });

        match self.queue.enqueue(wrapped, priority) {
            Ok(handle) => {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    let outcome = handle.outcome().await;
                    scheduler.complete(&name, outcome);
                });
            }
            Err(e) => {
                tracing::warn!("job {name:?} could not be enqueued: {e}");
                self.complete(&name, TaskOutcome::Dropped);
            }
        }
    }

    fn mark_running(&self, name: &str) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if let Some(entry) = jobs.get_mut(name) {
            entry.state = JobState::Running;
        }
    }

    fn record_duration(&self, name: &str, duration: Duration) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if let Some(entry) = jobs.get_mut(name) {
            entry.last_duration = Some(duration);
            let us = duration.as_micros() as f64;
            entry.ewma_duration_us = Some(match entry.ewma_duration_us {
                Some(prev) => EWMA_ALPHA * us + (1.0 - EWMA_ALPHA) * prev,
                None => us,
            });
            entry.runs += 1;
        }
    }

    fn complete(&self, name: &str, outcome: TaskOutcome) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        let Some(entry) = jobs.get_mut(name) else {
            return;
        };
        entry.in_flight = false;

        match outcome {
            TaskOutcome::Completed => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
                entry.state = JobState::Scheduled;
            }
            TaskOutcome::Failed(message) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(message);
                if entry.consecutive_failures >= DISABLE_AFTER {
                    entry.state = JobState::Disabled;
                    tracing::warn!(
                        "job {name:?} disabled after {} consecutive failures",
                        entry.consecutive_failures
                    );
                } else {
                    entry.state = JobState::Scheduled;
                }
            }
            // Lifecycle outcomes reschedule without counting as failures
            TaskOutcome::Cancelled | TaskOutcome::Expired | TaskOutcome::Dropped => {
                entry.state = JobState::Scheduled;
            }
        }

        if entry.state == JobState::Scheduled {
            entry.next_due = Instant::now() + jittered(entry.interval, entry.jitter);
        }
        drop(jobs);
        self.notify.notify_one();
    }
}

/// interval x (1 + U(-jitter, +jitter))
fn jittered(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..jitter);
    interval.mul_f64(factor.max(0.0))
}

/// Adaptive GPS polling period. Monotonic in speed: at or above
/// `threshold` the fastest interval applies, at rest the slowest, with
/// linear interpolation between. `current` is returned untouched when
/// the speed sample is unusable.
pub fn adjust_gps_interval(
    current: Duration,
    speed_m_s: f64,
    min: Duration,
    max: Duration,
    threshold: f64,
) -> Duration {
    if !speed_m_s.is_finite() || threshold <= 0.0 {
        return current;
    }
    if speed_m_s >= threshold {
        return min;
    }
    if speed_m_s <= 0.0 {
        return max;
    }
    let fraction = speed_m_s / threshold;
    let span = max.as_secs_f64() - min.as_secs_f64();
    Duration::from_secs_f64(max.as_secs_f64() - span * fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FullPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_body(counter: Arc<AtomicU32>) -> JobBody {
        Arc::new(move |_token| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn periodic_job_runs_repeatedly() {
        let queue = TaskQueue::start(2, 16, FullPolicy::RejectNew);
        let scheduler = Scheduler::new(queue.clone());
        let cancel = CancellationToken::new();

        let counter = Arc::new(AtomicU32::new(0));
        scheduler.register(
            "tick",
            Duration::from_millis(10),
            counting_body(counter.clone()),
            Priority::Normal,
            0.0,
        );

        let loop_handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        let _ = loop_handle.await;

        assert!(counter.load(Ordering::SeqCst) >= 3);
        let metrics = scheduler.metrics();
        assert!(metrics["tick"].runs >= 3);
        assert!(metrics["tick"].average_duration_ewma.is_some());
        queue.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn overrunning_job_is_single_flight() {
        let queue = TaskQueue::start(4, 16, FullPolicy::RejectNew);
        let scheduler = Scheduler::new(queue.clone());
        let cancel = CancellationToken::new();

        // Tracks concurrent invocations; fails the test if two overlap
        let active = Arc::new(AtomicU32::new(0));
        let max_active = Arc::new(AtomicU32::new(0));
        let body_active = active.clone();
        let body_max = max_active.clone();
        scheduler.register(
            "slow",
            Duration::from_millis(5),
            Arc::new(move |_token| {
                let active = body_active.clone();
                let max_active = body_max.clone();
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
            Priority::Normal,
            0.0,
        );

        let loop_handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let _ = loop_handle.await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        queue.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn failing_job_is_disabled_after_five() {
        let queue = TaskQueue::start(2, 16, FullPolicy::RejectNew);
        let scheduler = Scheduler::new(queue.clone());
        let cancel = CancellationToken::new();

        let attempts = Arc::new(AtomicU32::new(0));
        let body_attempts = attempts.clone();
        scheduler.register(
            "flaky",
            Duration::from_millis(5),
            Arc::new(move |_token| {
                let attempts = body_attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::storage("boom"))
                })
            }),
            Priority::Normal,
            0.0,
        );

        let loop_handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let metrics = scheduler.metrics();
        assert_eq!(metrics["flaky"].state, JobState::Disabled);
        assert_eq!(metrics["flaky"].consecutive_failures, 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert!(metrics["flaky"].last_error.is_some());

        // Explicit re-enable puts it back on the schedule
        scheduler.enable("flaky");
        assert_eq!(scheduler.metrics()["flaky"].state, JobState::Scheduled);

        cancel.cancel();
        let _ = loop_handle.await;
        queue.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn reregistration_replaces() {
        let queue = TaskQueue::start(1, 16, FullPolicy::RejectNew);
        let scheduler = Scheduler::new(queue.clone());

        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        scheduler.register(
            "job",
            Duration::from_millis(5),
            counting_body(first.clone()),
            Priority::Normal,
            0.0,
        );
        scheduler.register(
            "job",
            Duration::from_millis(5),
            counting_body(second.clone()),
            Priority::Normal,
            0.0,
        );

        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let _ = loop_handle.await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(second.load(Ordering::SeqCst) >= 1);
        queue.shutdown(Duration::from_millis(200)).await;
    }

    #[test]
    fn gps_interval_endpoints() {
        let min = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let current = Duration::from_secs(10);

        assert_eq!(adjust_gps_interval(current, 0.0, min, max, 1.0), max);
        assert_eq!(adjust_gps_interval(current, 1.0, min, max, 1.0), min);
        assert_eq!(adjust_gps_interval(current, 5.0, min, max, 1.0), min);
        assert_eq!(
            adjust_gps_interval(current, f64::NAN, min, max, 1.0),
            current
        );
    }

    #[test]
    fn gps_interval_is_monotonic() {
        let min = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let current = Duration::from_secs(10);
        let threshold = 2.0;

        let mut prev = adjust_gps_interval(current, 0.0, min, max, threshold);
        for step in 1..=20 {
            let speed = threshold * step as f64 / 20.0;
            let next = adjust_gps_interval(current, speed, min, max, threshold);
            assert!(next <= prev, "interval must not grow with speed");
            prev = next;
        }
    }
}
