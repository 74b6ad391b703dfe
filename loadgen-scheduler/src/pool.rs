//! Bookkeeping for the dynamically sized worker pool.
//!
//! [`WorkerPool`] owns all state shared between the pacing loop and the workers: the pool size,
//! the set of idle workers, the events currently assigned to a worker, and the backlog of events
//! waiting for a worker when the pool is saturated. Everything lives behind a single mutex that is
//! never held across an await point. [`WorkerPool::wait_idle`] resolves once no work is left.
//!
//! The pool does not spawn tasks itself. [`WorkerPool::assign`] decides *what* should happen to an
//! event and the scheduler acts on the decision.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};

use crate::pacing::IssuanceEvent;

/// Identifies a worker for the lifetime of a run.
pub(crate) type WorkerId = u64;

/// Channel through which an idle worker receives its next event.
pub(crate) type WorkerSender = mpsc::UnboundedSender<IssuanceEvent>;

/// What to do with an event when every worker is busy and the pool is at its maximum size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    /// Queue the event until a worker becomes available.
    ///
    /// The event is still issued, but it starts late. Every queued event counts towards
    /// [`RunSummary::under_capacity`](crate::RunSummary::under_capacity).
    #[default]
    Queue,
    /// Discard the event without dispatching it.
    ///
    /// Dropped events produce no outcome and count towards
    /// [`RunSummary::dropped`](crate::RunSummary::dropped).
    Drop,
}

/// The decision taken for an event by [`WorkerPool::assign`].
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Assignment {
    /// The event was handed to an idle worker.
    Idle(WorkerId),
    /// A new worker with the given ID must be spawned to run the event.
    Spawn(WorkerId),
    /// The pool is saturated and the event waits in the backlog.
    Queued,
    /// The pool is saturated and the event was discarded.
    Dropped,
}

/// Counters collected over the lifetime of a pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct PoolStats {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub dropped: u64,
    pub under_capacity: u64,
    pub capacity_errors: u64,
    pub peak_workers: usize,
    pub workers_retired: u64,
    pub size: usize,
}

#[derive(Debug)]
struct IdleWorker {
    id: WorkerId,
    sender: WorkerSender,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Number of live workers, idle or busy.
    size: usize,
    next_id: WorkerId,
    idle: Vec<IdleWorker>,
    /// Events handed to a worker that have not been recorded yet.
    pending: BTreeMap<u64, IssuanceEvent>,
    /// Events waiting for any worker to finish.
    backlog: VecDeque<IssuanceEvent>,
    stats: PoolStats,
}

impl PoolState {
    fn allocate(&mut self) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;
        self.size += 1;
        self.stats.peak_workers = self.stats.peak_workers.max(self.size);
        id
    }
}

/// Shared state of the worker pool.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    max_workers: usize,
    shrink_watermark: usize,
    overflow: Overflow,
    state: Mutex<PoolState>,
    released: Notify,
}

impl WorkerPool {
    pub(crate) fn new(max_workers: usize, shrink_watermark: usize, overflow: Overflow) -> Self {
        Self {
            max_workers,
            shrink_watermark,
            overflow,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Nothing panics while holding the lock, so a poisoned mutex still holds consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new idle worker ahead of the run.
    ///
    /// Returns `None` once the pool has reached its maximum size.
    pub(crate) fn prewarm(&self) -> Option<WorkerId> {
        let mut state = self.lock();
        (state.size < self.max_workers).then(|| state.allocate())
    }

    /// Makes a pre-warmed or freshly spawned worker available for events.
    pub(crate) fn add_idle(&self, id: WorkerId, sender: WorkerSender) {
        self.lock().idle.push(IdleWorker { id, sender });
    }

    /// Decides which worker runs `event`.
    ///
    /// Idle workers are preferred. The pool only grows when no worker is idle, and never beyond
    /// its maximum size.
    pub(crate) fn assign(&self, event: IssuanceEvent) -> Assignment {
        let mut state = self.lock();

        while let Some(worker) = state.idle.pop() {
            if worker.sender.send(event).is_ok() {
                state.pending.insert(event.seq, event);
                state.stats.issued += 1;
                return Assignment::Idle(worker.id);
            }
            // The worker is gone without retiring properly. Forget about it.
            state.size -= 1;
        }

        if state.size < self.max_workers {
            let id = state.allocate();
            state.pending.insert(event.seq, event);
            state.stats.issued += 1;
            return Assignment::Spawn(id);
        }

        match self.overflow {
            Overflow::Queue => {
                state.backlog.push_back(event);
                state.stats.issued += 1;
                state.stats.under_capacity += 1;
                Assignment::Queued
            }
            Overflow::Drop => {
                state.stats.dropped += 1;
                Assignment::Dropped
            }
        }
    }

    /// Releases the slot of a worker that could not be spawned.
    ///
    /// If the worker was meant to run `event`, the event moves to the front of the backlog so that
    /// the next free worker picks it up.
    pub(crate) fn spawn_failed(&self, id: WorkerId, event: Option<IssuanceEvent>) {
        let mut state = self.lock();
        state.size -= 1;
        state.stats.capacity_errors += 1;
        if let Some(event) = event
            && state.pending.remove(&event.seq).is_some()
        {
            state.backlog.push_front(event);
        }
        tracing::trace!(worker = id, "released slot of unspawned worker");
    }

    /// Claims the right to record the outcome of `event`.
    ///
    /// Returns `false` if the event has already been abandoned, in which case the outcome must be
    /// discarded.
    pub(crate) fn finish(&self, event: IssuanceEvent, success: bool) -> bool {
        let mut state = self.lock();
        if state.pending.remove(&event.seq).is_none() {
            return false;
        }
        if success {
            state.stats.succeeded += 1;
        } else {
            state.stats.failed += 1;
        }
        true
    }

    /// Returns a worker after it finished an event.
    ///
    /// If events are waiting in the backlog, the oldest one is returned and the worker stays busy.
    /// Otherwise the worker joins the idle set.
    pub(crate) fn release(&self, id: WorkerId, sender: &WorkerSender) -> Option<IssuanceEvent> {
        let next = {
            let mut state = self.lock();
            match state.backlog.pop_front() {
                Some(event) => {
                    state.pending.insert(event.seq, event);
                    Some(event)
                }
                None => {
                    state.idle.push(IdleWorker {
                        id,
                        sender: sender.clone(),
                    });
                    None
                }
            }
        };

        self.released.notify_waiters();
        next
    }

    /// Removes an idle worker from the pool if the pool is above its shrink watermark.
    ///
    /// Returns `true` if the worker must exit. Workers that have been handed an event in the
    /// meantime are no longer idle and stay.
    pub(crate) fn try_retire(&self, id: WorkerId) -> bool {
        let mut state = self.lock();
        if state.size <= self.shrink_watermark {
            return false;
        }
        let Some(index) = state.idle.iter().position(|worker| worker.id == id) else {
            return false;
        };

        state.idle.swap_remove(index);
        state.size -= 1;
        state.stats.workers_retired += 1;
        true
    }

    /// Returns the number of events that are running or waiting in the backlog.
    pub(crate) fn outstanding(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.backlog.len()
    }

    /// Waits until no event is running or waiting in the backlog.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.released.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Gives up on all outstanding events and returns them in issuance order.
    ///
    /// Workers that finish any of these events later will fail to [`finish`](Self::finish) them,
    /// so every event is reported exactly once.
    pub(crate) fn abandon_all(&self) -> Vec<IssuanceEvent> {
        let mut state = self.lock();
        let mut abandoned: Vec<_> = std::mem::take(&mut state.pending).into_values().collect();
        abandoned.extend(state.backlog.drain(..));
        abandoned.sort_unstable_by_key(|event| event.seq);

        state.stats.abandoned += abandoned.len() as u64;
        abandoned
    }

    /// Tears down the idle set. Live workers are aborted by the scheduler.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.idle.clear();
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            size: state.size,
            ..state.stats
        }
    }
}
