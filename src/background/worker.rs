//! In-process async task queue built on Tokio channels.
//!
//! [`TokioExecutor`] feeds a bounded mpsc channel drained by a single worker
//! loop. The loop takes a semaphore permit before it pulls the next job, so
//! while every permit is busy jobs stay in the channel and `dispatch` reports
//! [`DispatchError::QueueFull`] once it fills up. Each job runs in its own
//! Tokio task holding its permit. Job functions are synchronous, so each
//! attempt runs on the blocking pool.
//!
//! Jobs with a countdown leave the channel straight away and wait on a timer
//! in their own task; they take a permit when the countdown expires.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot},
    time::sleep,
};
use tracing::{debug, error, info, trace, warn};

use super::{DispatchError, Executor, Job, JobError, TaskHandle};

/// Default number of jobs allowed to run concurrently.
const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of jobs buffered before `dispatch` reports a full queue.
const DEFAULT_CAPACITY: usize = 1024;

/// Configuration for [`TokioExecutor`].
///
/// Built with [`WorkerConfig::new`] and the builder methods, or deserialized
/// from the host's configuration (missing fields take their defaults).
/// Durations are read as whole milliseconds.
///
/// | Setting            | Key                | Default |
/// |--------------------|--------------------|---------|
/// | `concurrency`      | `concurrency`      | 4       |
/// | `capacity`         | `capacity`         | 1024    |
/// | `retry_backoff`    | `retry_backoff_ms` | 100     |
/// | `max_backoff`      | `max_backoff_ms`   | 30000   |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub capacity: usize,
    #[serde(rename = "retry_backoff_ms", deserialize_with = "millis")]
    pub retry_backoff: Duration,
    #[serde(rename = "max_backoff_ms", deserialize_with = "millis")]
    pub max_backoff: Duration,
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            capacity: DEFAULT_CAPACITY,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Sets how many jobs may run at the same time. Clamped to at least 1.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets how many jobs may wait in the channel. Clamped to at least 1.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Sets the delay before the first retry; later retries double it.
    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Caps the retry delay.
    #[must_use]
    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }
}

struct Envelope {
    job: Job,
    reply: oneshot::Sender<Result<Value, JobError>>,
}

/// Executor that runs jobs on the Tokio runtime.
///
/// The worker loop stops once every `TokioExecutor` clone sharing its channel
/// is dropped; jobs already received still run to completion.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use deferq::{args, kwargs, task};
/// use deferq::background::{TokioExecutor, WorkerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let executor = Arc::new(TokioExecutor::spawn(WorkerConfig::new().concurrency(8)));
///     let ping = task("ping", executor, |_, _| Ok(serde_json::json!("pong")));
///     let handle = ping.delay(args![], kwargs! {}).unwrap().unwrap();
///     assert_eq!(handle.wait().await.unwrap(), "pong");
/// }
/// ```
#[derive(Clone)]
pub struct TokioExecutor {
    sender: mpsc::Sender<Envelope>,
    capacity: usize,
}

impl TokioExecutor {
    /// Starts the worker loop and returns an executor feeding it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(config: WorkerConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        tokio::spawn(run_worker(receiver, config));
        Self { sender, capacity }
    }
}

impl Executor for TokioExecutor {
    fn dispatch(&self, job: Job) -> Result<TaskHandle, DispatchError> {
        let (reply, receiver) = oneshot::channel();
        let name = job.name.clone();

        self.sender
            .try_send(Envelope { job, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })?;

        let handle = TaskHandle::pending(receiver);
        debug!(task = %name, id = %handle.id(), "task sent to worker");
        Ok(handle)
    }
}

async fn run_worker(mut receiver: mpsc::Receiver<Envelope>, config: WorkerConfig) {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    info!(
        concurrency = config.concurrency,
        capacity = config.capacity,
        "task worker started"
    );

    while let Some(envelope) = receiver.recv().await {
        let backoff = Backoff::new(config.retry_backoff, config.max_backoff);

        if let Some(countdown) = envelope.job.options.countdown {
            let permits = Arc::clone(&permits);
            trace!(task = %envelope.job.name, ?countdown, "task scheduled");
            tokio::spawn(async move {
                sleep(countdown).await;
                if let Ok(permit) = permits.acquire_owned().await {
                    run_job(envelope, permit, backoff).await;
                }
            });
            continue;
        }

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        tokio::spawn(run_job(envelope, permit, backoff));
    }

    debug!("task worker channel closed: shutting down");
}

async fn run_job(
    Envelope { job, reply }: Envelope,
    _permit: OwnedSemaphorePermit,
    backoff: Backoff,
) {
    let result = execute(&job, backoff).await;
    if reply.send(result).is_err() {
        trace!(task = %job.name, "task handle dropped before completion");
    }
}

async fn execute(job: &Job, mut backoff: Backoff) -> Result<Value, JobError> {
    let attempts = job.options.retries.unwrap_or(0).saturating_add(1);
    let mut attempt = 1;

    loop {
        let func = Arc::clone(&job.func);
        let args = job.args.clone();
        let kwargs = job.kwargs.clone();

        let result = tokio::task::spawn_blocking(move || func(&args, &kwargs))
            .await
            .unwrap_or_else(|e| Err(JobError::Panicked(e.to_string())));

        match result {
            Ok(value) => {
                debug!(task = %job.name, attempt, "task succeeded");
                return Ok(value);
            }
            Err(e) if attempt < attempts => {
                let delay = backoff.next_delay();
                warn!(task = %job.name, attempt, error = %e, ?delay, "task failed: retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(task = %job.name, attempt, error = %e, "task failed");
                return Err(e);
            }
        }
    }
}

/// Exponential retry delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        args, kwargs,
        task::{Options, task},
    };

    fn fast_config() -> WorkerConfig {
        WorkerConfig::new()
            .retry_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(4))
    }

    #[tokio::test]
    async fn runs_job_and_reports_result() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config()));
        let double = task("double", executor, |args, _| {
            let n = args[0].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        let handle = double.submit_now(args![21], kwargs! {}, Options::new()).unwrap();

        assert!(!handle.is_ready());
        assert_eq!(handle.wait().await, Ok(json!(42)));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let flaky = task("flaky", executor, move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(JobError::failed("not yet"))
            } else {
                Ok(json!("done"))
            }
        });

        let handle = flaky
            .submit_now(args![], kwargs! {}, Options::new().retries(3))
            .unwrap();

        assert_eq!(handle.wait().await, Ok(json!("done")));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retries_are_exhausted() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let broken = task("broken", executor, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(JobError::failed("boom"))
        });

        let handle = broken
            .submit_now(args![], kwargs! {}, Options::new().retries(1))
            .unwrap();

        assert_eq!(handle.wait().await, Err(JobError::Failed("boom".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_job_is_reported() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config()));
        let bad = task("bad", executor, |_, _| panic!("kaboom"));

        let handle = bad.submit_now(args![], kwargs! {}, Options::new()).unwrap();

        assert!(matches!(handle.wait().await, Err(JobError::Panicked(_))));
    }

    #[tokio::test]
    async fn honours_countdown() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config()));
        let later = task("later", executor, |_, _| Ok(json!(null)));
        let countdown = Duration::from_millis(20);

        let start = tokio::time::Instant::now();
        let handle = later
            .submit_now(args![], kwargs! {}, Options::new().countdown(countdown))
            .unwrap();
        handle.wait().await.unwrap();

        assert!(start.elapsed() >= countdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_worker_leaves_jobs_in_the_channel() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config().concurrency(1).capacity(1)));
        let started = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let (on_start, gate) = (Arc::clone(&started), Arc::clone(&release));
        let job = task("job", executor, move |args, _| {
            if args[0] == "block" {
                on_start.store(true, Ordering::SeqCst);
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(args[0].clone())
        });

        let running = job.submit_now(args!["block"], kwargs! {}, Options::new()).unwrap();
        while !started.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(1)).await;
        }

        // The worker pulls this one and then waits for the busy permit.
        let waiting = job.submit_now(args!["waiting"], kwargs! {}, Options::new()).unwrap();
        sleep(Duration::from_millis(50)).await;

        let buffered = job.submit_now(args!["buffered"], kwargs! {}, Options::new()).unwrap();
        let mut refused = 0;
        for n in 0..20 {
            match job.submit_now(args![n], kwargs! {}, Options::new()) {
                Err(e) => {
                    assert_eq!(e, DispatchError::QueueFull { capacity: 1 });
                    refused += 1;
                }
                Ok(_) => panic!("job {n} accepted while the worker was busy"),
            }
        }
        assert_eq!(refused, 20);

        release.store(true, Ordering::SeqCst);
        assert_eq!(running.wait().await, Ok(json!("block")));
        assert_eq!(waiting.wait().await, Ok(json!("waiting")));
        assert_eq!(buffered.wait().await, Ok(json!("buffered")));
    }

    #[tokio::test]
    async fn countdown_jobs_do_not_hold_up_the_channel() {
        let executor = Arc::new(TokioExecutor::spawn(fast_config().capacity(1)));
        let job = task("job", executor, |args, _| Ok(args[0].clone()));

        let later = job
            .submit_now(
                args!["later"],
                kwargs! {},
                Options::new().countdown(Duration::from_millis(30)),
            )
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        let now = job.submit_now(args!["now"], kwargs! {}, Options::new()).unwrap();

        assert_eq!(now.wait().await, Ok(json!("now")));
        assert_eq!(later.wait().await, Ok(json!("later")));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 35, 35]);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: WorkerConfig = serde_json::from_value(json!({"concurrency": 2})).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn config_reads_durations_as_milliseconds() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "retry_backoff_ms": 250,
            "max_backoff_ms": 5000,
        }))
        .unwrap();

        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.max_backoff, Duration::from_secs(5));
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }
}
