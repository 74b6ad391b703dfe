//! Pass/fail criteria evaluated against the metrics of a finished run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;

/// A latency percentile that must stay below a limit.
///
/// Used in: [`Thresholds::latency`]
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct LatencyThreshold {
    /// The percentile to check, between 0 and 1.
    ///
    /// # Default
    ///
    /// `0.95`
    pub percentile: f64,

    /// The request duration that the percentile must stay below.
    ///
    /// # Default
    ///
    /// `800ms`
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for LatencyThreshold {
    fn default() -> Self {
        Self {
            percentile: 0.95,
            max: Duration::from_millis(800),
        }
    }
}

/// Pass/fail criteria for a run.
///
/// Both limits are strict: a run with an error rate of exactly `max_error_rate` fails.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct Thresholds {
    /// Share of failed and abandoned requests that the run must stay below.
    ///
    /// # Default
    ///
    /// `0.01`
    pub max_error_rate: f64,

    /// Limit for the request duration of every response, whatever its status.
    pub latency: LatencyThreshold,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.01,
            latency: LatencyThreshold::default(),
        }
    }
}

impl Thresholds {
    /// Checks the metrics against every threshold.
    pub fn evaluate(&self, metrics: &Metrics) -> Vec<Check> {
        let error_rate = Check::ErrorRate {
            observed: metrics.error_rate(),
            limit: self.max_error_rate,
        };

        let observed = metrics
            .request_duration
            .quantile(self.latency.percentile)
            .ok()
            .flatten()
            .map(Duration::from_secs_f64);
        let latency = Check::Latency {
            percentile: self.latency.percentile,
            observed,
            limit: self.latency.max,
        };

        vec![error_rate, latency]
    }
}

/// The evaluation of a single threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Check {
    /// Share of requests that did not succeed.
    ErrorRate {
        /// The error rate of the run.
        observed: f64,
        /// The configured limit.
        limit: f64,
    },
    /// Percentile of the request duration.
    Latency {
        /// The checked percentile.
        percentile: f64,
        /// The observed duration, or `None` if no response arrived.
        observed: Option<Duration>,
        /// The configured limit.
        limit: Duration,
    },
}

impl Check {
    /// Whether the observed value stays below the limit.
    ///
    /// A latency check without any response passes, the error rate covers that case.
    pub fn passed(&self) -> bool {
        match *self {
            Check::ErrorRate { observed, limit } => observed < limit,
            Check::Latency {
                observed, limit, ..
            } => observed.is_none_or(|observed| observed < limit),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::ErrorRate { observed, limit } => {
                write!(f, "error rate {:.2}% < {:.2}%", observed * 100.0, limit * 100.0)
            }
            Check::Latency {
                percentile,
                observed: Some(observed),
                limit,
            } => write!(f, "p({}) {observed:.2?} < {limit:?}", percentile * 100.0),
            Check::Latency {
                percentile,
                observed: None,
                limit,
            } => write!(f, "p({}) - < {limit:?}", percentile * 100.0),
        }
    }
}
