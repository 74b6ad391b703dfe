//! Arrival pacing: turning a [`Schedule`] into a sequence of [`IssuanceEvent`]s.
//!
//! Both pacing modes work on the cumulative expected-event curve of the schedule. An arrival
//! happens whenever the curve crosses a *mark*, so the long-run number of arrivals always follows
//! the integral of the rate, no matter how the rate changes over time:
//!
//! - [`Pacing::Fixed`] puts mark `k` at `k + 0.5`, giving evenly spaced arrivals at constant
//!   rates.
//! - [`Pacing::Poisson`] advances marks by exponentially distributed steps with mean one, which
//!   yields a non-homogeneous Poisson process.

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;

/// Strategy for placing arrivals on the schedule.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Deterministic, evenly spaced inter-arrival times.
    #[default]
    Fixed,
    /// Exponentially distributed inter-arrival times.
    Poisson,
}

/// A point in time at which one unit of work must be dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IssuanceEvent {
    /// Position of the event in the run, starting at zero.
    pub seq: u64,
    /// Scheduled offset from the start of the run.
    pub scheduled: Duration,
}

/// Iterator over the arrivals of a [`Schedule`].
///
/// Created by [`Schedule::arrivals`].
#[derive(Debug)]
pub struct Arrivals<'a> {
    schedule: &'a Schedule,
    pacing: Pacing,
    rng: SmallRng,
    mark: f64,
    seq: u64,
}

impl<'a> Arrivals<'a> {
    pub(crate) fn new(schedule: &'a Schedule, pacing: Pacing, seed: u64) -> Self {
        Self {
            schedule,
            pacing,
            rng: SmallRng::seed_from_u64(seed),
            mark: 0.0,
            seq: 0,
        }
    }

    fn next_mark(&mut self) -> f64 {
        match self.pacing {
            Pacing::Fixed => self.seq as f64 + 0.5,
            Pacing::Poisson => {
                let step: f64 = self.rng.sample(Exp1);
                self.mark + step
            }
        }
    }
}

impl Iterator for Arrivals<'_> {
    type Item = IssuanceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let mark = self.next_mark();
        let scheduled = self.schedule.offset_for_events(mark)?;
        if scheduled >= self.schedule.total_duration() {
            return None;
        }

        let event = IssuanceEvent {
            seq: self.seq,
            scheduled,
        };
        self.mark = mark;
        self.seq += 1;
        Some(event)
    }
}
