//! An open-loop arrival-rate load generator.
//!
//! The [`ArrivalRateScheduler`] issues units of work at a target rate that changes over time
//! according to a [`Schedule`] of linear ramps. Unlike a closed-loop generator, where a fixed
//! number of workers loop over request-then-wait, the issuance times here depend *only* on the
//! schedule. When work gets slow, the scheduler grows its worker pool (up to a maximum) to keep
//! up, and it reports every event that found the pool saturated.
//!
//! The scheduler knows nothing about the work itself. Callers plug in a [`Dispatch`] that performs
//! one unit of work, and an [`OutcomeSink`] that receives one [`Outcome`] per issued event.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod error;
mod outcome;
mod pacing;
mod pool;
mod schedule;
mod scheduler;

pub use crate::error::{ConfigError, Result};
pub use crate::outcome::{Detail, Dispatch, Outcome, OutcomeSink};
pub use crate::pacing::{Arrivals, IssuanceEvent, Pacing};
pub use crate::pool::Overflow;
pub use crate::schedule::{Schedule, ScheduleBuilder, Stage};
pub use crate::scheduler::{
    ArrivalRateScheduler, DEFAULT_GRACE_PERIOD, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_WORKERS,
    RunSummary, SchedulerBuilder,
};
