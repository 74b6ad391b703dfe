//! The open-loop [`ArrivalRateScheduler`].
//!
//! A single pacing loop walks the arrivals of a [`Schedule`] and hands every event to the
//! [`WorkerPool`](crate::pool). Workers are tokio tasks that run the caller's [`Dispatch`] and
//! report to the [`OutcomeSink`]. The pacing loop never waits for a dispatch to complete, so slow
//! responses cannot slow down the arrival rate; they only make the pool grow.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, Result};
use crate::outcome::{Detail, Dispatch, Outcome, OutcomeSink};
use crate::pacing::{IssuanceEvent, Pacing};
use crate::pool::{Assignment, Overflow, WorkerId, WorkerPool, WorkerSender};
use crate::schedule::Schedule;

/// Default for [`SchedulerBuilder::max_workers`].
pub const DEFAULT_MAX_WORKERS: usize = 100;
/// Default for [`SchedulerBuilder::idle_timeout`].
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default for [`SchedulerBuilder::grace_period`].
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// A builder for creating an [`ArrivalRateScheduler`].
#[derive(Debug)]
pub struct SchedulerBuilder {
    schedule: Schedule,
    pre_allocated_workers: usize,
    max_workers: usize,
    shrink_watermark: Option<usize>,
    idle_timeout: Duration,
    grace_period: Duration,
    pacing: Pacing,
    overflow: Overflow,
    seed: u64,
}

impl SchedulerBuilder {
    /// The number of idle workers spawned before the first event.
    pub fn pre_allocated_workers(mut self, workers: usize) -> Self {
        self.pre_allocated_workers = workers;
        self
    }

    /// The maximum number of concurrent workers.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// The pool size below which idle workers do not retire.
    ///
    /// Defaults to the number of pre-allocated workers.
    pub fn shrink_watermark(mut self, workers: usize) -> Self {
        self.shrink_watermark = Some(workers);
        self
    }

    /// How long a worker stays idle before it may retire.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// How long to wait for outstanding events after the schedule ends or the run is cancelled.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The distribution of inter-arrival times.
    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// What happens to events while the pool is saturated.
    pub fn overflow(mut self, overflow: Overflow) -> Self {
        self.overflow = overflow;
        self
    }

    /// Seeds the random source used for pacing, making runs reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the options and creates the scheduler.
    pub fn build(self) -> Result<ArrivalRateScheduler> {
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.pre_allocated_workers > self.max_workers {
            return Err(ConfigError::PreallocationExceedsMax {
                pre_allocated: self.pre_allocated_workers,
                max: self.max_workers,
            });
        }
        let shrink_watermark = self.shrink_watermark.unwrap_or(self.pre_allocated_workers);
        if shrink_watermark > self.max_workers {
            return Err(ConfigError::WatermarkExceedsMax {
                watermark: shrink_watermark,
                max: self.max_workers,
            });
        }

        Ok(ArrivalRateScheduler {
            schedule: self.schedule,
            pre_allocated_workers: self.pre_allocated_workers,
            max_workers: self.max_workers,
            shrink_watermark,
            idle_timeout: self.idle_timeout,
            grace_period: self.grace_period,
            pacing: self.pacing,
            overflow: self.overflow,
            seed: self.seed,
        })
    }
}

/// Statistics of a finished run.
///
/// Under normal completion, `succeeded + failed + abandoned == issued`: every issued event is
/// reported to the sink exactly once.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Events handed to a worker or queued for one.
    pub issued: u64,
    /// Events whose dispatch succeeded.
    pub succeeded: u64,
    /// Events whose dispatch failed or panicked.
    pub failed: u64,
    /// Events still outstanding when the grace period ran out.
    pub abandoned: u64,
    /// Events discarded because the pool was saturated, see [`Overflow::Drop`].
    pub dropped: u64,
    /// Events that found the pool saturated, whether queued or dropped.
    pub under_capacity: u64,
    /// Workers that could not be spawned.
    pub capacity_errors: u64,
    /// The largest pool size during the run.
    pub peak_workers: usize,
    /// Workers that retired after being idle.
    pub workers_retired: u64,
    /// Wall time from the start of the run, including pre-allocating workers, until teardown.
    pub elapsed: Duration,
    /// Whether the run was cancelled before the schedule ended.
    pub cancelled: bool,
}

impl RunSummary {
    /// The share of issued events that did not succeed.
    pub fn error_rate(&self) -> f64 {
        if self.issued == 0 {
            return 0.0;
        }
        (self.failed + self.abandoned) as f64 / self.issued as f64
    }
}

/// Issues work at the arrival rate of a [`Schedule`], independent of how long the work takes.
///
/// ```
/// use std::time::Duration;
///
/// use loadgen_scheduler::{ArrivalRateScheduler, Outcome, Schedule};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() -> Result<(), loadgen_scheduler::ConfigError> {
/// let schedule = Schedule::builder(1.0)
///     .stage(Duration::from_secs(30), 10.0)
///     .build()?;
/// let scheduler = ArrivalRateScheduler::builder(schedule)
///     .pre_allocated_workers(5)
///     .max_workers(50)
///     .build()?;
///
/// let dispatch = || async {
///     tokio::time::sleep(Duration::from_millis(100)).await;
///     Ok::<_, std::io::Error>(())
/// };
/// let sink = |_outcome: Outcome<()>| {};
///
/// let summary = scheduler.run(dispatch, sink, CancellationToken::new()).await;
/// assert_eq!(summary.issued, 165);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ArrivalRateScheduler {
    schedule: Schedule,
    pre_allocated_workers: usize,
    max_workers: usize,
    shrink_watermark: usize,
    idle_timeout: Duration,
    grace_period: Duration,
    pacing: Pacing,
    overflow: Overflow,
    seed: u64,
}

impl ArrivalRateScheduler {
    /// Constructs a new scheduler builder for the given schedule.
    pub fn builder(schedule: Schedule) -> SchedulerBuilder {
        SchedulerBuilder {
            schedule,
            pre_allocated_workers: 1,
            max_workers: DEFAULT_MAX_WORKERS,
            shrink_watermark: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            pacing: Pacing::default(),
            overflow: Overflow::default(),
            seed: rand::random(),
        }
    }

    /// The schedule this scheduler follows.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// The maximum number of concurrent workers.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs the schedule to completion or until `cancel` is triggered.
    ///
    /// Every issued event is dispatched on a worker task and its [`Outcome`] is passed to `sink`.
    /// Once issuance stops, outstanding events get the configured grace period to complete before
    /// they are reported as [`Detail::Abandoned`].
    pub async fn run<D, S>(&self, dispatch: D, sink: S, cancel: CancellationToken) -> RunSummary
    where
        D: Dispatch,
        S: OutcomeSink<D::Detail>,
    {
        let start = Instant::now();
        let shared = Arc::new(Shared {
            dispatch,
            sink,
            pool: WorkerPool::new(self.max_workers, self.shrink_watermark, self.overflow),
            idle_timeout: self.idle_timeout,
            start,
        });
        let mut workers = JoinSet::new();

        tracing::info!(
            duration = ?self.schedule.total_duration(),
            expected_events = self.schedule.total_events(),
            max_workers = self.max_workers,
            pacing = ?self.pacing,
            "starting arrival-rate run"
        );

        for _ in 0..self.pre_allocated_workers {
            let Some(id) = shared.pool.prewarm() else {
                break;
            };
            let (sender, receiver) = mpsc::unbounded_channel();
            if spawn_worker(&mut workers, &shared, id, sender.clone(), receiver, None) {
                shared.pool.add_idle(id, sender);
            } else {
                tracing::error!(worker = id, "failed to pre-allocate worker");
                shared.pool.spawn_failed(id, None);
            }
        }

        let mut cancelled = false;
        let mut warned_capacity = false;

        for event in self.schedule.arrivals(self.pacing, self.seed) {
            let deadline = start.checked_add(event.scheduled);
            if deadline.is_none_or(|deadline| deadline > Instant::now()) {
                if !sleep_or_cancel(deadline, &cancel).await {
                    cancelled = true;
                    break;
                }
            } else if cancel.is_cancelled() {
                // behind schedule, catch up without sleeping
                cancelled = true;
                break;
            }

            // reap retired workers
            while workers.try_join_next().is_some() {}

            match shared.pool.assign(event) {
                Assignment::Idle(_) => (),
                Assignment::Spawn(id) => {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    if spawn_worker(&mut workers, &shared, id, sender, receiver, Some(event)) {
                        tracing::debug!(worker = id, seq = event.seq, "spawned worker");
                    } else {
                        tracing::error!(
                            worker = id,
                            seq = event.seq,
                            "failed to spawn worker, continuing with reduced concurrency"
                        );
                        shared.pool.spawn_failed(id, Some(event));
                    }
                }
                Assignment::Queued | Assignment::Dropped => {
                    if !warned_capacity {
                        warned_capacity = true;
                        tracing::warn!(
                            seq = event.seq,
                            max_workers = self.max_workers,
                            overflow = ?self.overflow,
                            "worker pool saturated, arrivals fall behind schedule"
                        );
                    }
                }
            }
        }

        if !cancelled {
            let end = start.checked_add(self.schedule.total_duration());
            cancelled = !sleep_or_cancel(end, &cancel).await;
        }

        tracing::debug!(
            outstanding = shared.pool.outstanding(),
            cancelled,
            "issuance stopped, draining workers"
        );

        let drained = tokio::time::timeout(self.grace_period, shared.pool.wait_idle()).await;
        if drained.is_err() {
            let abandoned = shared.pool.abandon_all();
            tracing::warn!(
                abandoned = abandoned.len(),
                grace_period = ?self.grace_period,
                "abandoning outstanding events after grace period"
            );
            let now = Instant::now();
            for event in abandoned {
                let latency = since_scheduled(now, start, event);
                let outcome = Outcome::new(event, Duration::ZERO, latency, Detail::Abandoned);
                shared.sink.record(outcome);
            }
        }

        shared.pool.close();
        workers.abort_all();
        while workers.join_next().await.is_some() {}

        let stats = shared.pool.stats();
        let summary = RunSummary {
            issued: stats.issued,
            succeeded: stats.succeeded,
            failed: stats.failed,
            abandoned: stats.abandoned,
            dropped: stats.dropped,
            under_capacity: stats.under_capacity + stats.dropped,
            capacity_errors: stats.capacity_errors,
            peak_workers: stats.peak_workers,
            workers_retired: stats.workers_retired,
            elapsed: start.elapsed(),
            cancelled,
        };

        tracing::info!(
            issued = summary.issued,
            succeeded = summary.succeeded,
            failed = summary.failed,
            abandoned = summary.abandoned,
            dropped = summary.dropped,
            peak_workers = summary.peak_workers,
            cancelled = summary.cancelled,
            "arrival-rate run finished"
        );

        summary
    }
}

/// State shared between the pacing loop and all workers of one run.
struct Shared<D, S> {
    dispatch: D,
    sink: S,
    pool: WorkerPool,
    idle_timeout: Duration,
    start: Instant,
}

impl<D, S> Shared<D, S>
where
    D: Dispatch,
    S: OutcomeSink<D::Detail>,
{
    /// Runs a single event and records its outcome.
    async fn execute(&self, event: IssuanceEvent) {
        let started = Instant::now();
        let lag = since_scheduled(started, self.start, event);

        let result = AssertUnwindSafe(self.dispatch.dispatch())
            .catch_unwind()
            .await;
        let latency = started.elapsed();

        let detail = match result {
            Ok(Ok(detail)) => Detail::Success(detail),
            Ok(Err(error)) => Detail::Failure(error.to_string()),
            Err(_panic) => Detail::Failure("dispatch panicked".to_owned()),
        };

        let success = matches!(detail, Detail::Success(_));
        if self.pool.finish(event, success) {
            self.sink.record(Outcome::new(event, lag, latency, detail));
        }
    }
}

/// Sleeps until `deadline`, or forever if the deadline is past what an [`Instant`] can represent.
///
/// Returns `false` if `cancel` fired first.
async fn sleep_or_cancel(deadline: Option<Instant>, cancel: &CancellationToken) -> bool {
    let Some(deadline) = deadline else {
        cancel.cancelled().await;
        return false;
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

/// Time elapsed at `now` since `event` was scheduled to start.
fn since_scheduled(now: Instant, start: Instant, event: IssuanceEvent) -> Duration {
    start
        .checked_add(event.scheduled)
        .map_or(Duration::ZERO, |scheduled| {
            now.saturating_duration_since(scheduled)
        })
}

/// Spawns a worker task into `workers`.
///
/// Returns `false` if no runtime is available to spawn onto. Workers are only spawned from
/// within [`ArrivalRateScheduler::run`], which is always polled on a runtime, so this does not
/// happen in practice. The pool still accounts for it, see `WorkerPool::spawn_failed`.
fn spawn_worker<D, S>(
    workers: &mut JoinSet<()>,
    shared: &Arc<Shared<D, S>>,
    id: WorkerId,
    sender: WorkerSender,
    receiver: mpsc::UnboundedReceiver<IssuanceEvent>,
    first: Option<IssuanceEvent>,
) -> bool
where
    D: Dispatch,
    S: OutcomeSink<D::Detail>,
{
    let Ok(handle) = Handle::try_current() else {
        return false;
    };
    let shared = Arc::clone(shared);
    workers.spawn_on(worker(shared, id, sender, receiver, first), &handle);
    true
}

async fn worker<D, S>(
    shared: Arc<Shared<D, S>>,
    id: WorkerId,
    sender: WorkerSender,
    mut receiver: mpsc::UnboundedReceiver<IssuanceEvent>,
    mut next: Option<IssuanceEvent>,
) where
    D: Dispatch,
    S: OutcomeSink<D::Detail>,
{
    loop {
        let event = match next.take() {
            Some(event) => event,
            None => match tokio::time::timeout(shared.idle_timeout, receiver.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(_elapsed) => {
                    if shared.pool.try_retire(id) {
                        tracing::debug!(worker = id, "retiring idle worker");
                        return;
                    }
                    continue;
                }
            },
        };

        shared.execute(event).await;
        next = shared.pool.release(id, &sender);
    }
}
