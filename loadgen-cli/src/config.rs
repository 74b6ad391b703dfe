//! Configuration for the load generator.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `LOADGEN__`)
//! 2. The `INFER_URL` environment variable, which sets [`Target::url`]
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! The defaults describe a six minute ramp from 1 to 60 requests per second against a local
//! inference endpoint. See [`Config`] for a description of all fields.
//!
//! # Environment Variables
//!
//! Environment variables use `LOADGEN__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `LOADGEN__TARGET__URL=http://10.0.0.5:8000/infer` sets the endpoint
//! - `LOADGEN__SCENARIO__MAX_WORKERS=500` raises the worker limit
//! - `LOADGEN__SCENARIO__STAGES=[{duration="30s",target=5}]` replaces all stages
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! target:
//!   url: http://10.0.0.5:8000/infer
//!
//! scenario:
//!   max_workers: 500
//!   stages:
//!     - duration: 30s
//!       target: 5
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use loadgen_scheduler::{
    ArrivalRateScheduler, DEFAULT_GRACE_PERIOD, DEFAULT_IDLE_TIMEOUT, Overflow, Pacing, Schedule,
    Stage,
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::payload::{DEFAULT_BATCH_SIZE, DEFAULT_CANDIDATES};
use crate::thresholds::Thresholds;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "LOADGEN__";

/// Environment variable that overrides the target URL.
const TARGET_URL_ENV: &str = "INFER_URL";

/// The endpoint under test.
///
/// Used in: [`Config::target`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Target {
    /// URL that receives a `POST` request for every arrival.
    ///
    /// # Default
    ///
    /// `http://localhost:8000/infer`
    ///
    /// # Environment Variables
    ///
    /// - `INFER_URL`
    /// - `LOADGEN__TARGET__URL` (takes precedence)
    pub url: String,

    /// Timeout of a single request, including reading the response body.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Pause after each request before the worker becomes available again.
    ///
    /// The pause counts towards the iteration duration but not towards the request duration.
    ///
    /// # Default
    ///
    /// `10ms`
    #[serde(with = "humantime_serde")]
    pub think_time: Duration,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/infer".to_owned(),
            timeout: Duration::from_secs(60),
            think_time: Duration::from_millis(10),
        }
    }
}

/// A linear ramp of the arrival rate.
///
/// Used in: [`Scenario::stages`]
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct StageConfig {
    /// How long the ramp takes.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// The rate reached at the end of the ramp, in arrivals per [`Scenario::time_unit`].
    pub target: f64,
}

/// The arrival-rate scenario.
///
/// Used in: [`Config::scenario`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Scenario {
    /// Rate at the beginning of the first stage, in arrivals per `time_unit`.
    ///
    /// # Default
    ///
    /// `1`
    pub start_rate: f64,

    /// The period that all rates refer to.
    ///
    /// # Default
    ///
    /// `1s`
    #[serde(with = "humantime_serde")]
    pub time_unit: Duration,

    /// Workers spawned before the first arrival.
    ///
    /// # Default
    ///
    /// `20`
    pub pre_allocated_workers: usize,

    /// Upper bound for concurrently running requests.
    ///
    /// # Default
    ///
    /// `200`
    pub max_workers: usize,

    /// Pool size below which idle workers are never retired.
    ///
    /// # Default
    ///
    /// `None` (same as `pre_allocated_workers`)
    pub shrink_watermark: Option<usize>,

    /// How long a worker may stay idle before it retires.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How long outstanding requests may take to finish once the schedule ends.
    ///
    /// # Default
    ///
    /// `30s`
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Placement of arrivals: `fixed` or `poisson`.
    ///
    /// # Default
    ///
    /// `fixed`
    pub pacing: Pacing,

    /// Behavior when all workers are busy: `queue` or `drop`.
    ///
    /// # Default
    ///
    /// `queue`
    pub overflow: Overflow,

    /// Seed for pacing and payload randomness.
    ///
    /// # Default
    ///
    /// `None` (random seed for every run)
    pub seed: Option<u64>,

    /// The ramps of the arrival rate, in order.
    ///
    /// # Default
    ///
    /// `2m` to 10, `2m` to 30, `2m` to 60
    pub stages: Vec<StageConfig>,
}

impl Scenario {
    /// Builds the rate schedule described by this scenario.
    pub fn schedule(&self) -> loadgen_scheduler::Result<Schedule> {
        let stages = self
            .stages
            .iter()
            .map(|stage| Stage::new(stage.duration, stage.target));

        Schedule::builder(self.start_rate)
            .time_unit(self.time_unit)
            .stages(stages)
            .build()
    }

    /// Builds a scheduler for this scenario that uses `seed` for pacing.
    pub fn scheduler(&self, seed: u64) -> loadgen_scheduler::Result<ArrivalRateScheduler> {
        let mut builder = ArrivalRateScheduler::builder(self.schedule()?)
            .pre_allocated_workers(self.pre_allocated_workers)
            .max_workers(self.max_workers)
            .idle_timeout(self.idle_timeout)
            .grace_period(self.grace_period)
            .pacing(self.pacing)
            .overflow(self.overflow)
            .seed(seed);

        if let Some(watermark) = self.shrink_watermark {
            builder = builder.shrink_watermark(watermark);
        }

        builder.build()
    }
}

impl Default for Scenario {
    fn default() -> Self {
        let minutes = |m: u64| Duration::from_secs(m * 60);

        Self {
            start_rate: 1.0,
            time_unit: Duration::from_secs(1),
            pre_allocated_workers: 20,
            max_workers: 200,
            shrink_watermark: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            pacing: Pacing::Fixed,
            overflow: Overflow::Queue,
            seed: None,
            stages: vec![
                StageConfig {
                    duration: minutes(2),
                    target: 10.0,
                },
                StageConfig {
                    duration: minutes(2),
                    target: 30.0,
                },
                StageConfig {
                    duration: minutes(2),
                    target: 60.0,
                },
            ],
        }
    }
}

/// Request bodies sent to the target.
///
/// Used in: [`Config::payload`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Payload {
    /// Texts to pick inputs from.
    ///
    /// # Default
    ///
    /// Eight short sentiment phrases, half positive and half negative.
    pub candidates: Vec<String>,

    /// Number of inputs per request, each picked uniformly at random.
    ///
    /// # Default
    ///
    /// `2`
    pub batch_size: usize,
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.iter().map(|&c| c.to_owned()).collect(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Log output format.
///
/// Used in: [`Logging::format`]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Compact output with colors.
    ///
    /// ```text
    /// 2025-06-02T09:14:05.221Z  INFO loadgen_scheduler::scheduler: run finished issued=165
    /// ```
    Pretty,

    /// Plain text output without colors.
    Simplified,

    /// JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl std::fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format, expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// Valid levels in increasing severity: TRACE, DEBUG, INFO, WARN, ERROR, OFF. The `RUST_LOG`
    /// environment variable overrides this and allows per-module filters.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `LOADGEN__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto`
    ///
    /// # Environment Variable
    ///
    /// `LOADGEN__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the load generator.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// The endpoint under test.
    pub target: Target,
    /// Arrival rate, worker pool and pacing.
    pub scenario: Scenario,
    /// Request bodies.
    pub payload: Payload,
    /// Pass/fail criteria evaluated after the run.
    pub thresholds: Thresholds,
    /// Logging to stderr.
    pub logging: Logging,
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file, and the environment.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if `path` is given)
    /// 3. `INFER_URL`
    /// 4. Environment variables (prefixed with `LOADGEN__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if environment variables
    /// contain invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(
                Env::raw()
                    .only(&[TARGET_URL_ENV])
                    .map(|_| "target.url".into()),
            )
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_describe_ramp() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = Config::load(None).unwrap();

            assert_eq!(config.target.url, "http://localhost:8000/infer");
            assert_eq!(config.scenario.pre_allocated_workers, 20);
            assert_eq!(config.scenario.max_workers, 200);
            assert_eq!(config.scenario.seed, None);
            assert_eq!(config.payload.candidates.len(), 8);
            assert_eq!(config.logging.level, LevelFilter::INFO);

            let schedule = config.scenario.schedule().unwrap();
            assert_eq!(schedule.total_duration(), Duration::from_secs(360));
            assert_eq!(schedule.peak_rate(), 60.0);
            // 2m ramps: (1 + 10) * 60 + (10 + 30) * 60 + (30 + 60) * 60
            assert!((schedule.total_events() - 8460.0).abs() < 1e-6);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LOADGEN__TARGET__TIMEOUT", "5s");
            jail.set_env("LOADGEN__SCENARIO__MAX_WORKERS", "500");
            jail.set_env("LOADGEN__SCENARIO__PACING", "poisson");
            jail.set_env("LOADGEN__SCENARIO__OVERFLOW", "drop");
            jail.set_env("LOADGEN__SCENARIO__SEED", "42");
            jail.set_env(
                "LOADGEN__SCENARIO__STAGES",
                r#"[{duration="30s",target=5}]"#,
            );
            jail.set_env("LOADGEN__THRESHOLDS__MAX_ERROR_RATE", "0.05");
            jail.set_env("LOADGEN__LOGGING__LEVEL", "debug");
            jail.set_env("LOADGEN__LOGGING__FORMAT", "json");

            let config = Config::load(None).unwrap();

            assert_eq!(config.target.timeout, Duration::from_secs(5));
            assert_eq!(config.scenario.max_workers, 500);
            assert_eq!(config.scenario.pacing, Pacing::Poisson);
            assert_eq!(config.scenario.overflow, Overflow::Drop);
            assert_eq!(config.scenario.seed, Some(42));
            assert_eq!(
                config.scenario.stages,
                [StageConfig {
                    duration: Duration::from_secs(30),
                    target: 5.0
                }]
            );
            assert_eq!(config.thresholds.max_error_rate, 0.05);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            target:
                url: http://inference:8000/infer
                think_time: 0s
            scenario:
                start_rate: 10
                time_unit: 1m
                stages:
                    - duration: 1m
                      target: 20
            payload:
                candidates: ["one", "two"]
                batch_size: 4
            thresholds:
                latency:
                    percentile: 0.99
                    max: 1500ms
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.target.url, "http://inference:8000/infer");
            assert_eq!(config.target.think_time, Duration::ZERO);
            assert_eq!(config.payload.candidates, ["one", "two"]);
            assert_eq!(config.payload.batch_size, 4);
            assert_eq!(config.thresholds.latency.percentile, 0.99);
            assert_eq!(config.thresholds.latency.max, Duration::from_millis(1500));
            // Untouched sections keep their defaults.
            assert_eq!(config.scenario.max_workers, 200);

            let schedule = config.scenario.schedule().unwrap();
            assert_eq!(schedule.time_unit(), Duration::from_secs(60));
            assert!((schedule.total_events() - 15.0).abs() < 1e-9);

            Ok(())
        });
    }

    #[test]
    fn infer_url_overrides_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            target:
                url: http://from-yaml:8000/infer
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("INFER_URL", "http://from-env:8000/infer");

            let config = Config::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.target.url, "http://from-env:8000/infer");

            // The prefixed variable wins over the shorthand.
            jail.set_env("LOADGEN__TARGET__URL", "http://prefixed:8000/infer");
            let config = Config::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.target.url, "http://prefixed:8000/infer");

            Ok(())
        });
    }

    #[test]
    fn scheduler_rejects_invalid_scenario() {
        let scenario = Scenario {
            pre_allocated_workers: 300,
            ..Default::default()
        };
        assert!(scenario.scheduler(0).is_err());

        let scenario = Scenario {
            stages: vec![],
            ..Default::default()
        };
        assert!(scenario.schedule().is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Auto);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
