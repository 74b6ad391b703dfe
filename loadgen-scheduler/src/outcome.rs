//! The boundary between the scheduler and the work it paces.
//!
//! Callers supply a [`Dispatch`] that performs one unit of work, and an [`OutcomeSink`] that
//! receives one [`Outcome`] per issued event. Outcomes arrive in completion order, which is not
//! necessarily the order in which events were issued.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::pacing::IssuanceEvent;

/// A unit of work that the scheduler issues once per arrival.
///
/// This is implemented for all closures returning a future that resolves to a `Result`, so most
/// callers never implement it by hand:
///
/// ```
/// # use loadgen_scheduler::Dispatch;
/// fn assert_dispatch(_: impl Dispatch) {}
///
/// assert_dispatch(|| async { Ok::<_, std::io::Error>(42) });
/// ```
pub trait Dispatch: Send + Sync + 'static {
    /// Caller-defined data attached to successful outcomes.
    type Detail: Send + 'static;
    /// The error of a failed unit of work. Only its message is retained.
    type Error: fmt::Display + Send + 'static;

    /// Performs one unit of work.
    fn dispatch(&self) -> impl Future<Output = Result<Self::Detail, Self::Error>> + Send;
}

impl<F, Fut, T, E> Dispatch for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Detail = T;
    type Error = E;

    fn dispatch(&self) -> impl Future<Output = Result<T, E>> + Send {
        self()
    }
}

/// Receives the outcome of every issued event.
///
/// Called concurrently from all workers, so implementations must synchronize internally.
pub trait OutcomeSink<T>: Send + Sync + 'static {
    /// Records a single outcome.
    fn record(&self, outcome: Outcome<T>);
}

impl<T, F> OutcomeSink<T> for F
where
    F: Fn(Outcome<T>) + Send + Sync + 'static,
{
    fn record(&self, outcome: Outcome<T>) {
        self(outcome)
    }
}

impl<T: Send + 'static> OutcomeSink<T> for mpsc::UnboundedSender<Outcome<T>> {
    fn record(&self, outcome: Outcome<T>) {
        // The receiver going away only means nobody is interested in outcomes anymore.
        self.send(outcome).ok();
    }
}

/// What happened to a dispatched event.
#[derive(Clone, Debug, PartialEq)]
pub enum Detail<T> {
    /// The dispatch completed successfully.
    Success(T),
    /// The dispatch returned an error or panicked.
    Failure(String),
    /// The dispatch did not finish within the grace period after the run ended.
    Abandoned,
}

/// The result of one dispatched event.
#[derive(Clone, Debug)]
pub struct Outcome<T> {
    event: IssuanceEvent,
    lag: Duration,
    latency: Duration,
    detail: Detail<T>,
}

impl<T> Outcome<T> {
    pub(crate) fn new(
        event: IssuanceEvent,
        lag: Duration,
        latency: Duration,
        detail: Detail<T>,
    ) -> Self {
        Self {
            event,
            lag,
            latency,
            detail,
        }
    }

    /// The event this outcome belongs to.
    pub fn event(&self) -> IssuanceEvent {
        self.event
    }

    /// Whether the dispatch completed successfully.
    pub fn success(&self) -> bool {
        matches!(self.detail, Detail::Success(_))
    }

    /// How long the dispatch took.
    ///
    /// For abandoned events this is the time between the scheduled issuance and abandonment.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// How long the event waited between its scheduled time and the start of its dispatch.
    ///
    /// A growing lag means the pool could not keep up with the schedule.
    pub fn lag(&self) -> Duration {
        self.lag
    }

    /// The detail of this outcome.
    pub fn detail(&self) -> &Detail<T> {
        &self.detail
    }

    /// Consumes the outcome and returns its detail.
    pub fn into_detail(self) -> Detail<T> {
        self.detail
    }
}
