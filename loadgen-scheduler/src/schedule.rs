//! Piecewise-linear arrival-rate schedules.
//!
//! A [`Schedule`] starts at a start rate and then walks through a list of [`Stage`]s. Each stage
//! ramps linearly from the rate where the previous stage ended to its own target over its
//! duration. Rates are expressed per [`time_unit`](Schedule::time_unit), so a rate of `10` with a
//! time unit of one minute means ten arrivals per minute.
//!
//! Besides the instantaneous rate, the schedule exposes the cumulative number of expected events
//! and its inverse. The pacer in [`crate::pacing`] places arrivals on that cumulative curve.

use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::pacing::{Arrivals, Pacing};

/// A linear ramp segment of a [`Schedule`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stage {
    /// How long the ramp lasts. Zero-length stages jump to `target` instantly.
    pub duration: Duration,
    /// The rate reached at the end of the stage, per time unit.
    pub target: f64,
}

impl Stage {
    /// Creates a stage ramping to `target` over `duration`.
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// A builder for creating a [`Schedule`].
#[derive(Debug)]
pub struct ScheduleBuilder {
    start_rate: f64,
    time_unit: Duration,
    stages: Vec<Stage>,
}

impl ScheduleBuilder {
    /// The unit of time that all rates refer to. Defaults to one second.
    pub fn time_unit(mut self, time_unit: Duration) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Appends a stage ramping to `target` over `duration`.
    pub fn stage(mut self, duration: Duration, target: f64) -> Self {
        self.stages.push(Stage::new(duration, target));
        self
    }

    /// Appends all given stages in order.
    pub fn stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Validates the configuration and creates the schedule.
    pub fn build(self) -> Result<Schedule> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        if self.time_unit.is_zero() {
            return Err(ConfigError::ZeroTimeUnit);
        }
        check_rate(None, self.start_rate)?;
        for (index, stage) in self.stages.iter().enumerate() {
            check_rate(Some(index), stage.target)?;
        }

        let unit_secs = self.time_unit.as_secs_f64();
        let mut segments = Vec::with_capacity(self.stages.len());
        let mut start = Duration::ZERO;
        let mut from = self.start_rate;
        let mut events_before = 0.0;

        for stage in &self.stages {
            let segment = Segment {
                start,
                duration: stage.duration,
                from,
                to: stage.target,
                from_per_sec: from / unit_secs,
                to_per_sec: stage.target / unit_secs,
                events_before,
            };
            events_before += segment.events_within(stage.duration);
            start = start
                .checked_add(stage.duration)
                .ok_or(ConfigError::DurationOverflow)?;
            from = stage.target;
            segments.push(segment);
        }

        if start.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }

        Ok(Schedule {
            start_rate: self.start_rate,
            time_unit: self.time_unit,
            stages: self.stages,
            segments,
            total_duration: start,
            total_events: events_before,
        })
    }
}

fn check_rate(stage: Option<usize>, rate: f64) -> Result<()> {
    if rate.is_finite() && rate >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate { stage, rate })
    }
}

/// A stage resolved to absolute offsets and per-second rates.
#[derive(Clone, Debug)]
struct Segment {
    start: Duration,
    duration: Duration,
    from: f64,
    to: f64,
    from_per_sec: f64,
    to_per_sec: f64,
    /// Expected events of all previous segments.
    events_before: f64,
}

impl Segment {
    fn end(&self) -> Duration {
        self.start + self.duration
    }

    /// Rate per time unit at `offset` into this segment.
    fn rate_at(&self, offset: Duration) -> f64 {
        let progress = offset.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * progress
    }

    /// Acceleration of the per-second rate, halved: `E(x) = r0·x + slope·x²`.
    fn half_slope(&self) -> f64 {
        if self.duration.is_zero() {
            return 0.0;
        }
        (self.to_per_sec - self.from_per_sec) / (2.0 * self.duration.as_secs_f64())
    }

    /// Expected events within the first `offset` of this segment.
    fn events_within(&self, offset: Duration) -> f64 {
        let x = offset.min(self.duration).as_secs_f64();
        self.from_per_sec * x + self.half_slope() * x * x
    }

    /// Offset into this segment at which `events` expected events have accumulated.
    ///
    /// Solves `slope·x² + r0·x - events = 0` in the form `2e / (r0 + √(r0² + 4·slope·e))`, which
    /// stays well-defined for flat, rising and falling ramps alike.
    fn offset_for(&self, events: f64) -> Duration {
        if events <= 0.0 {
            return Duration::ZERO;
        }
        let r0 = self.from_per_sec;
        let discriminant = (r0 * r0 + 4.0 * self.half_slope() * events).max(0.0);
        let denominator = r0 + discriminant.sqrt();
        if denominator <= 0.0 {
            return Duration::ZERO;
        }
        let x = 2.0 * events / denominator;
        Duration::try_from_secs_f64(x)
            .unwrap_or(self.duration)
            .min(self.duration)
    }
}

/// An immutable, validated arrival-rate schedule.
///
/// Construct it with [`Schedule::builder`].
#[derive(Clone, Debug)]
pub struct Schedule {
    start_rate: f64,
    time_unit: Duration,
    stages: Vec<Stage>,
    segments: Vec<Segment>,
    total_duration: Duration,
    total_events: f64,
}

impl Schedule {
    /// Constructs a new schedule builder starting at `start_rate`.
    pub fn builder(start_rate: f64) -> ScheduleBuilder {
        ScheduleBuilder {
            start_rate,
            time_unit: Duration::from_secs(1),
            stages: Vec::new(),
        }
    }

    /// The rate at offset zero, per time unit.
    pub fn start_rate(&self) -> f64 {
        self.start_rate
    }

    /// The unit of time that all rates refer to.
    pub fn time_unit(&self) -> Duration {
        self.time_unit
    }

    /// The configured stages in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// The number of events the schedule is expected to produce over its whole duration.
    pub fn total_events(&self) -> f64 {
        self.total_events
    }

    /// The highest rate reached anywhere in the schedule, per time unit.
    pub fn peak_rate(&self) -> f64 {
        self.stages
            .iter()
            .map(|stage| stage.target)
            .fold(self.start_rate, f64::max)
    }

    /// The instantaneous target rate at `offset`, per time unit.
    ///
    /// Offsets past the end of the schedule yield the final stage's target.
    pub fn rate_at(&self, offset: Duration) -> f64 {
        match self.segment_at(offset) {
            Some(segment) => segment.rate_at(offset - segment.start),
            None => self.stages.last().map_or(self.start_rate, |stage| stage.target),
        }
    }

    /// The instantaneous target rate at `offset`, in events per second.
    pub fn rate_per_second_at(&self, offset: Duration) -> f64 {
        self.rate_at(offset) / self.time_unit.as_secs_f64()
    }

    /// The expected number of events between the start of the schedule and `offset`.
    pub fn expected_events(&self, offset: Duration) -> f64 {
        match self.segment_at(offset) {
            Some(segment) => segment.events_before + segment.events_within(offset - segment.start),
            None => self.total_events,
        }
    }

    /// The offset at which the expected number of events reaches `events`.
    ///
    /// This is the inverse of [`expected_events`](Self::expected_events). Returns `None` if the
    /// schedule never accumulates that many events.
    pub fn offset_for_events(&self, events: f64) -> Option<Duration> {
        if !events.is_finite() || events > self.total_events {
            return None;
        }

        let segment = self
            .segments
            .iter()
            .filter(|segment| !segment.duration.is_zero())
            .find(|segment| {
                let events_after = segment.events_before + segment.events_within(segment.duration);
                events <= events_after
            })?;

        Some(segment.start + segment.offset_for(events - segment.events_before))
    }

    /// Generates the arrival events of this schedule in non-decreasing time order.
    ///
    /// `seed` drives the random inter-arrival times of [`Pacing::Poisson`] and is ignored for
    /// [`Pacing::Fixed`].
    pub fn arrivals(&self, pacing: Pacing, seed: u64) -> Arrivals<'_> {
        Arrivals::new(self, pacing, seed)
    }

    fn segment_at(&self, offset: Duration) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|segment| offset >= segment.start && offset < segment.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn rejects_empty_schedule() {
        let result = Schedule::builder(1.0).build();
        assert_eq!(result.unwrap_err(), ConfigError::EmptySchedule);
    }

    #[test]
    fn rejects_invalid_rates() {
        let result = Schedule::builder(-1.0).stage(secs(1), 1.0).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidRate { stage: None, .. })
        ));

        let result = Schedule::builder(1.0)
            .stage(secs(1), 1.0)
            .stage(secs(1), f64::INFINITY)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidRate { stage: Some(1), .. })
        ));
    }

    #[test]
    fn rejects_zero_time_unit_and_duration() {
        let result = Schedule::builder(1.0)
            .time_unit(Duration::ZERO)
            .stage(secs(1), 1.0)
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::ZeroTimeUnit);

        let result = Schedule::builder(1.0).stage(Duration::ZERO, 5.0).build();
        assert_eq!(result.unwrap_err(), ConfigError::ZeroDuration);
    }

    #[test]
    fn rejects_overflowing_duration() {
        let result = Schedule::builder(1.0)
            .stage(Duration::MAX, 1.0)
            .stage(secs(1), 1.0)
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::DurationOverflow);
    }

    #[test]
    fn linear_ramp_interpolates() {
        let schedule = Schedule::builder(2.0).stage(secs(10), 12.0).build().unwrap();

        for t in 0..10 {
            let expected = 2.0 + (12.0 - 2.0) * t as f64 / 10.0;
            assert_close(schedule.rate_at(secs(t)), expected);
        }
        assert_close(schedule.rate_at(Duration::from_millis(2500)), 4.5);
        assert_close(schedule.rate_at(secs(10)), 12.0);
        assert_close(schedule.rate_at(secs(100)), 12.0);
    }

    #[test]
    fn stages_chain_from_previous_target() {
        let schedule = Schedule::builder(1.0)
            .stage(secs(10), 11.0)
            .stage(secs(10), 1.0)
            .build()
            .unwrap();

        assert_close(schedule.rate_at(secs(5)), 6.0);
        assert_close(schedule.rate_at(secs(10)), 11.0);
        assert_close(schedule.rate_at(secs(15)), 6.0);
        assert_eq!(schedule.total_duration(), secs(20));
        assert_close(schedule.peak_rate(), 11.0);
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let schedule = Schedule::builder(1.0)
            .stage(Duration::ZERO, 10.0)
            .stage(secs(5), 10.0)
            .build()
            .unwrap();

        assert_close(schedule.rate_at(Duration::ZERO), 10.0);
        assert_close(schedule.expected_events(secs(5)), 50.0);
    }

    #[test]
    fn time_unit_normalizes_rates() {
        let schedule = Schedule::builder(60.0)
            .time_unit(Duration::from_secs(60))
            .stage(secs(60), 60.0)
            .build()
            .unwrap();

        assert_close(schedule.rate_at(secs(30)), 60.0);
        assert_close(schedule.rate_per_second_at(secs(30)), 1.0);
        assert_close(schedule.total_events(), 60.0);
    }

    #[test]
    fn expected_events_integrates_ramp() {
        let schedule = Schedule::builder(1.0).stage(secs(30), 10.0).build().unwrap();

        assert_close(schedule.total_events(), 165.0);
        // 1·15 + 0.15·15² = 48.75
        assert_close(schedule.expected_events(secs(15)), 48.75);
        assert_close(schedule.expected_events(secs(60)), 165.0);
    }

    #[test]
    fn offset_for_events_inverts_expected_events() {
        let schedule = Schedule::builder(1.0)
            .stage(secs(30), 10.0)
            .stage(secs(10), 10.0)
            .stage(secs(20), 0.0)
            .build()
            .unwrap();

        for millis in (0..60_000).step_by(750) {
            let offset = Duration::from_millis(millis);
            let events = schedule.expected_events(offset);
            let inverse = schedule.offset_for_events(events).unwrap();
            let diff = inverse.as_secs_f64() - offset.as_secs_f64();
            assert!(diff.abs() < 1e-6, "{offset:?} -> {events} -> {inverse:?}");
        }

        assert!(schedule.offset_for_events(schedule.total_events() + 1.0).is_none());
    }

    #[test]
    fn offset_for_events_skips_idle_segments() {
        let schedule = Schedule::builder(0.0)
            .stage(secs(10), 0.0)
            .stage(Duration::ZERO, 4.0)
            .stage(secs(10), 4.0)
            .build()
            .unwrap();

        let offset = schedule.offset_for_events(2.0).unwrap();
        assert_eq!(offset, Duration::from_millis(10_500));
    }
}
