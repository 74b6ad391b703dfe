//! Aggregation and printing of per-request outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytesize::ByteSize;
use loadgen_scheduler::{Detail, Outcome, OutcomeSink, RunSummary};
use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::http::{CheckError, Exchange};

/// Aggregated metrics of a run.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Requests that passed their checks.
    pub succeeded: u64,
    /// Requests that failed their checks or could not be sent.
    pub failed: u64,
    /// Requests still outstanding when the grace period ran out.
    pub abandoned: u64,
    /// Response bytes of successful requests.
    pub bytes_received: u64,

    /// Seconds from sending a request until its response was read, for every response that
    /// arrived, including those that failed their checks.
    pub request_duration: DDSketch,
    /// Seconds each completed dispatch took, including think time and failures.
    pub iteration_duration: DDSketch,
    /// Seconds between the scheduled and the actual start of each dispatch.
    pub lag: DDSketch,

    /// Number of failures per error message.
    pub errors: BTreeMap<String, u64>,
}

impl Metrics {
    /// Number of outcomes recorded.
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.abandoned
    }

    /// Share of recorded outcomes that did not succeed. Abandoned requests count as failures.
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.failed + self.abandoned) as f64 / total as f64,
        }
    }

    fn record(&mut self, outcome: Outcome<Exchange>) {
        let lag = outcome.lag().as_secs_f64();
        let latency = outcome.latency().as_secs_f64();

        match outcome.into_detail() {
            Detail::Success(exchange) => {
                self.succeeded += 1;
                self.bytes_received += exchange.bytes;
                self.iteration_duration.add(latency);
                self.lag.add(lag);
            }
            Detail::Failure(error) => {
                self.failed += 1;
                self.iteration_duration.add(latency);
                self.lag.add(lag);
                *self.errors.entry(error).or_default() += 1;
            }
            Detail::Abandoned => {
                self.abandoned += 1;
            }
        }
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("succeeded", &self.succeeded)
            .field("failed", &self.failed)
            .field("abandoned", &self.abandoned)
            .field("bytes_received", &self.bytes_received)
            .field("request_duration", &self.request_duration.count())
            .field("iteration_duration", &self.iteration_duration.count())
            .field("lag", &self.lag.count())
            .field("errors", &self.errors)
            .finish()
    }
}

/// An [`OutcomeSink`] that aggregates outcomes into [`Metrics`].
///
/// Clones share the same metrics, so one clone can be handed to the scheduler while another one
/// reads the results after the run.
#[derive(Clone, Debug, Default)]
pub struct MetricsSink {
    inner: Arc<Mutex<Metrics>>,
}

impl MetricsSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Metrics> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a copy of the metrics recorded so far.
    pub fn snapshot(&self) -> Metrics {
        self.lock().clone()
    }

    /// Number of outcomes recorded so far.
    pub fn recorded(&self) -> u64 {
        self.lock().total()
    }

    /// Records the request duration of a response, whether or not it passed its checks.
    ///
    /// Outcomes only carry the error message of failed requests, so the dispatch reports
    /// durations here before handing its result to the scheduler.
    pub fn record_response(&self, result: &Result<Exchange, CheckError>) {
        let duration = match result {
            Ok(exchange) => Some(exchange.duration),
            Err(error) => error.duration(),
        };
        if let Some(duration) = duration {
            self.lock().request_duration.add(duration.as_secs_f64());
        }
    }
}

impl OutcomeSink<Exchange> for MetricsSink {
    fn record(&self, outcome: Outcome<Exchange>) {
        if let Detail::Failure(error) = outcome.detail() {
            tracing::debug!(seq = outcome.event().seq, error = %error, "request failed");
        }
        self.lock().record(outcome);
    }
}

/// Prints the metrics of a run to stdout.
pub fn print_metrics(metrics: &Metrics, summary: &RunSummary) {
    let elapsed = summary.elapsed;

    print!(
        "{} ({} requests",
        "REQUESTS:".bold().green(),
        metrics.total().bold()
    );
    if metrics.failed > 0 {
        print!(", {}", format!("{} FAILED", metrics.failed).bold().red());
    }
    if metrics.abandoned > 0 {
        print!(
            ", {}",
            format!("{} ABANDONED", metrics.abandoned).bold().red()
        );
    }
    println!(")");
    print_rate(metrics.total(), elapsed);
    print!(", {} received", ByteSize::b(metrics.bytes_received).bold());
    print_throughput(metrics.bytes_received, elapsed);

    if metrics.request_duration.count() > 0 {
        println!("{}", "REQUEST DURATION:".bold().green());
        print_percentiles(&metrics.request_duration, Duration::from_secs_f64);
    }
    if metrics.iteration_duration.count() > 0 {
        println!("{}", "ITERATION DURATION:".bold().green());
        print_percentiles(&metrics.iteration_duration, Duration::from_secs_f64);
    }
    if metrics.lag.count() > 0 {
        println!("{}", "SCHEDULE LAG:".bold().green());
        print_percentiles(&metrics.lag, Duration::from_secs_f64);
    }

    println!(
        "{} {} peak, {} retired",
        "WORKERS:".bold().green(),
        summary.peak_workers.bold(),
        summary.workers_retired
    );
    if summary.under_capacity > 0 || summary.dropped > 0 || summary.capacity_errors > 0 {
        println!(
            "  {}",
            format!(
                "{} events found no free worker, {} dropped, {} spawn errors",
                summary.under_capacity, summary.dropped, summary.capacity_errors
            )
            .yellow()
        );
    }

    if !metrics.errors.is_empty() {
        println!("{}", "ERRORS:".bold().red());
        for (error, count) in &metrics.errors {
            println!("  {count:>6} {error}");
        }
    }
}

fn print_percentiles<T: fmt::Debug>(sketch: &DDSketch, map: impl Fn(f64) -> T) {
    let quantile = |q| sketch.quantile(q).ok().flatten().map(&map);
    let avg = sketch.sum().map(|sum| map(sum / sketch.count() as f64));

    println!(
        "  avg: {:.2?}; p50: {:.2?}; p90: {:.2?}; p95: {:.2?}; p99: {:.2?}",
        Unwrapped(avg).bold(),
        Unwrapped(quantile(0.5)),
        Unwrapped(quantile(0.9)),
        Unwrapped(quantile(0.95)),
        Unwrapped(quantile(0.99)),
    );
}

fn print_rate(total: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { total as f64 / secs } else { 0.0 };
    print!("  {:.2} requests/s", rate.bold());
}

fn print_throughput(bytes: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
    println!(" ({:.2}/s)", ByteSize::b(throughput as u64));
}

/// Debug-formats the inner value, or `-` if there is none.
struct Unwrapped<T>(Option<T>);

impl<T: fmt::Debug> fmt::Debug for Unwrapped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use loadgen_scheduler::{ArrivalRateScheduler, Schedule};
    use reqwest::StatusCode;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn exchange(millis: u64) -> Exchange {
        Exchange {
            duration: Duration::from_millis(millis),
            bytes: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aggregates_scheduler_outcomes() {
        let schedule = Schedule::builder(10.0)
            .stage(Duration::from_secs(2), 10.0)
            .build()
            .unwrap();
        let scheduler = ArrivalRateScheduler::builder(schedule)
            .pre_allocated_workers(2)
            .max_workers(10)
            .seed(0)
            .build()
            .unwrap();

        let sink = MetricsSink::new();
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let dispatch = {
            let counter = Arc::clone(&counter);
            let sink = sink.clone();
            move || {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let sink = sink.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let result = if n % 4 == 0 {
                        Err(CheckError::Status {
                            status: StatusCode::INTERNAL_SERVER_ERROR,
                            duration: Duration::from_millis(900),
                        })
                    } else {
                        Ok(exchange(50))
                    };
                    sink.record_response(&result);
                    result
                }
            }
        };

        let summary = scheduler
            .run(dispatch, sink.clone(), CancellationToken::new())
            .await;
        let metrics = sink.snapshot();

        assert_eq!(summary.issued, 20);
        assert_eq!(metrics.total(), 20);
        assert_eq!(metrics.succeeded, 15);
        assert_eq!(metrics.failed, 5);
        assert_eq!(metrics.bytes_received, 1500);
        assert_eq!(metrics.error_rate(), 0.25);
        assert_eq!(metrics.request_duration.count(), 20);
        // the five slow failures make up the tail
        let p90 = metrics.request_duration.quantile(0.9).unwrap().unwrap();
        assert!(p90 > 0.8, "{p90}");
        assert_eq!(metrics.iteration_duration.count(), 20);
        assert_eq!(
            metrics.errors.get("unexpected status 500 Internal Server Error"),
            Some(&5)
        );
    }

    #[test]
    fn empty_metrics_have_no_errors() {
        let metrics = Metrics::default();
        assert_eq!(metrics.total(), 0);
        assert_eq!(metrics.error_rate(), 0.0);
    }

    #[test]
    fn transport_errors_have_no_request_duration() {
        let sink = MetricsSink::new();
        let invalid_url = reqwest::Client::new()
            .get("not a url")
            .build()
            .map(|_| ())
            .unwrap_err();

        sink.record_response(&Err(CheckError::Transport(invalid_url)));
        sink.record_response(&Err(CheckError::NotJson {
            content_type: None,
            duration: Duration::from_millis(30),
        }));
        sink.record_response(&Ok(exchange(10)));

        assert_eq!(sink.snapshot().request_duration.count(), 2);
    }

    #[test]
    fn debug_prints_counts() {
        let mut metrics = Metrics {
            succeeded: 3,
            failed: 1,
            bytes_received: 300,
            ..Default::default()
        };
        metrics.request_duration.add(0.1);
        metrics.request_duration.add(0.2);
        metrics.lag.add(0.0);

        let debug = format!("{metrics:?}");
        assert!(debug.starts_with("Metrics { succeeded: 3, failed: 1, abandoned: 0"));
        assert!(debug.contains("request_duration: 2, iteration_duration: 0, lag: 1"));
    }

    #[test]
    fn prints_byte_counts() {
        let metrics = Metrics {
            succeeded: 1,
            bytes_received: 2048,
            ..Default::default()
        };
        let received = ByteSize::b(metrics.bytes_received).to_string();
        assert!(received.starts_with('2') && received.ends_with("KiB"), "{received}");

        // zero elapsed time must not divide by zero
        print_metrics(&metrics, &RunSummary::default());
    }
}
