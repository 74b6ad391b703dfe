use thiserror::Error;

/// Errors raised while constructing a [`Schedule`](crate::Schedule) or an
/// [`ArrivalRateScheduler`](crate::ArrivalRateScheduler).
///
/// A run never starts with an invalid configuration, so these are the only errors the scheduler
/// surfaces. Failures during a run are reported through outcomes and the
/// [`RunSummary`](crate::RunSummary) instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The schedule has no stages.
    #[error("schedule must contain at least one stage")]
    EmptySchedule,

    /// A rate is negative, infinite or NaN.
    ///
    /// `stage` is `None` for the start rate.
    #[error("invalid rate {rate} for {}", stage_name(.stage))]
    InvalidRate {
        /// Index of the offending stage.
        stage: Option<usize>,
        /// The rejected rate.
        rate: f64,
    },

    /// The time unit rates are normalized to is zero.
    #[error("time unit must be greater than zero")]
    ZeroTimeUnit,

    /// The stage durations add up to more than a [`Duration`](std::time::Duration) can hold.
    #[error("schedule total duration overflows")]
    DurationOverflow,

    /// All stages together last no time at all.
    #[error("schedule total duration must be greater than zero")]
    ZeroDuration,

    /// The worker pool would not be allowed to hold any worker.
    #[error("max workers must be at least 1")]
    NoWorkers,

    /// More workers are pre-allocated than the pool may ever hold.
    #[error("pre-allocated workers ({pre_allocated}) exceed max workers ({max})")]
    PreallocationExceedsMax {
        /// Requested number of pre-allocated workers.
        pre_allocated: usize,
        /// Configured maximum pool size.
        max: usize,
    },

    /// The pool would never shrink down to its configured watermark.
    #[error("shrink watermark ({watermark}) exceeds max workers ({max})")]
    WatermarkExceedsMax {
        /// Requested shrink watermark.
        watermark: usize,
        /// Configured maximum pool size.
        max: usize,
    },
}

fn stage_name(stage: &Option<usize>) -> String {
    match stage {
        Some(index) => format!("stage {index}"),
        None => "start rate".to_owned(),
    }
}

/// Result type for schedule and scheduler construction.
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_rate_names_stage() {
        let err = ConfigError::InvalidRate {
            stage: Some(2),
            rate: -1.0,
        };
        assert_eq!(err.to_string(), "invalid rate -1 for stage 2");

        let err = ConfigError::InvalidRate {
            stage: None,
            rate: f64::NAN,
        };
        assert_eq!(err.to_string(), "invalid rate NaN for start rate");
    }

    #[test]
    fn duration_overflow_message() {
        assert_eq!(
            ConfigError::DurationOverflow.to_string(),
            "schedule total duration overflows"
        );
    }
}
