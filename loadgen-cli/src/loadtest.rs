//! Runs the configured scenario against the target and evaluates the thresholds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use loadgen_scheduler::RunSummary;
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::config::Config;
use crate::http::InferenceRemote;
use crate::metrics::{Metrics, MetricsSink, print_metrics};
use crate::payload::PayloadGenerator;
use crate::thresholds::Check;

/// The result of a load test.
#[derive(Debug)]
pub struct Report {
    /// Seed used for pacing and payloads. Configure it to repeat the run.
    pub seed: u64,
    /// Statistics reported by the scheduler.
    pub summary: RunSummary,
    /// Aggregated request metrics.
    pub metrics: Metrics,
    /// Evaluation of every threshold.
    pub checks: Vec<Check>,
}

impl Report {
    /// Whether all thresholds passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(Check::passed)
    }

    /// Prints metrics and threshold results to stdout.
    pub fn print(&self) {
        println!();
        println!("{} (seed: {})", "## RESULTS".bold(), self.seed);
        if self.summary.cancelled {
            println!("{}", "Run was cancelled before the schedule ended.".yellow());
        }
        print_metrics(&self.metrics, &self.summary);

        println!();
        println!("{}", "## THRESHOLDS".bold());
        for check in &self.checks {
            if check.passed() {
                println!("  {} {check}", "✓".green());
            } else {
                println!("  {} {check}", "✗".red().bold());
            }
        }
    }
}

/// Runs the scenario in `config` until the schedule ends or `cancel` is triggered.
///
/// Returns an error only if the configuration is invalid. Failed requests are part of the report.
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<Report> {
    let seed = config.scenario.seed.unwrap_or_else(rand::random);
    let scheduler = config
        .scenario
        .scheduler(seed)
        .context("invalid scenario")?;
    anyhow::ensure!(
        !config.payload.candidates.is_empty(),
        "payload candidates must not be empty"
    );

    let remote = Arc::new(
        InferenceRemote::new(&config.target).context("failed to create the HTTP client")?,
    );
    let payloads = PayloadGenerator::new(
        config.payload.candidates.clone(),
        config.payload.batch_size,
        seed,
    );
    let think_time = config.target.think_time;
    let sink = MetricsSink::new();

    tracing::info!(url = remote.url(), seed, "starting load test");

    let responses = sink.clone();
    let dispatch = move || {
        let remote = Arc::clone(&remote);
        let responses = responses.clone();
        let request = payloads.next_request();
        async move {
            let result = remote.infer(&request).await;
            responses.record_response(&result);
            if !think_time.is_zero() {
                tokio::time::sleep(think_time).await;
            }
            result
        }
    };

    let bar = ProgressBar::new_spinner()
        .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
        .with_message("Running load test:");
    bar.enable_steady_tick(Duration::from_millis(100));

    let run = scheduler.run(dispatch, sink.clone(), cancel);
    tokio::pin!(run);

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let summary = loop {
        tokio::select! {
            summary = &mut run => break summary,
            _ = ticker.tick() => {
                bar.set_message(format!("Running load test ({} requests):", sink.recorded()));
            }
        }
    };
    bar.finish_and_clear();

    let metrics = sink.snapshot();
    let checks = config.thresholds.evaluate(&metrics);

    Ok(Report {
        seed,
        summary,
        metrics,
        checks,
    })
}

/// Validates the scenario in `config` and prints its schedule without sending any requests.
pub fn plan(config: &Config) -> Result<()> {
    let scenario = &config.scenario;
    let schedule = scenario.schedule().context("invalid scenario")?;
    // Validate the worker settings as well.
    scenario.scheduler(0).context("invalid scenario")?;

    let unit = schedule.time_unit();

    println!("{} {}", "## PLAN".bold(), config.target.url.blue());
    println!(
        "  duration: {:?}; peak rate: {}/{unit:?}; expected requests: {:.0}",
        schedule.total_duration().bold(),
        schedule.peak_rate().bold(),
        schedule.total_events().bold()
    );
    println!(
        "  workers: {} pre-allocated, {} max; pacing: {:?}; overflow: {:?}",
        scenario.pre_allocated_workers,
        scenario.max_workers,
        scenario.pacing,
        scenario.overflow
    );

    let mut from = schedule.start_rate();
    let mut offset = Duration::ZERO;
    for (index, stage) in schedule.stages().iter().enumerate() {
        offset += stage.duration;
        println!(
            "  stage {}: {from} -> {}/{unit:?} over {:?} (until {offset:?}, {:.0} requests)",
            index + 1,
            stage.target,
            stage.duration,
            schedule.expected_events(offset) - schedule.expected_events(offset - stage.duration),
        );
        from = stage.target;
    }

    Ok(())
}
