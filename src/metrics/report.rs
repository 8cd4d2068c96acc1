use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::client::ErrorKind;

use super::histogram::{DisplayBucket, LatencyHistogram};
use super::series::{RollingSeries, SeriesPoint};
use super::RequestOutcome;

// ─── Configuration ───────────────────────────────────────────────

/// Series width used when the print interval is zero (final-only mode
/// still feeds the charts).
const DEFAULT_SERIES_WIDTH: Duration = Duration::from_secs(1);

/// How many series points a snapshot carries for the charts.
const SNAPSHOT_WINDOW: usize = 600;

// ─── Public types ────────────────────────────────────────────────

/// Single-consumer streaming aggregator.
/// Workers feed outcomes through the recorder channel, `collect`
/// folds them into the rollup state, and any task may take a
/// `snapshot()` at any time.
pub struct StreamReport {
    inner: Mutex<Inner>,
    done_tx: watch::Sender<bool>,
    // Keeps the done channel alive even before anyone subscribes
    _done_rx: watch::Receiver<bool>,
}

/// Latency aggregate block of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub stdev_us: f64,
    pub p50_us: u64,
    pub p75_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
}

/// Point-in-time, value-copied projection of the aggregate state.
/// Immutable; safe to hold across further aggregation. Snapshots taken
/// after the run completed are identical to each other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub elapsed_secs: f64,
    pub finished: bool,

    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rps: f64,
    pub error_rate: f64,

    pub latency: LatencyStats,
    pub error_latency: LatencyStats,

    /// Status code → count, keys unique, ordering irrelevant
    pub codes: HashMap<u16, u64>,
    /// Error tag → count
    pub errors: HashMap<ErrorKind, u64>,

    pub bytes_in: u64,
    pub bytes_out: u64,

    /// Width of one rolling-series interval
    pub interval_secs: f64,
    /// Most recent window of the rolling series, oldest first
    pub series: Vec<SeriesPoint>,
    /// Latency distribution of successful requests over fixed edges
    pub histogram: Vec<DisplayBucket>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    t0: Instant,
    completed_at: Option<Instant>,

    total: u64,
    succeeded: u64,
    failed: u64,

    hist: LatencyHistogram,
    err_hist: LatencyHistogram,
    // Running moments kept beside the histogram so snapshotting is a
    // constant-time value copy
    lat_min_us: u64,
    lat_max_us: u64,
    lat_sum_us: f64,
    lat_sum_sq_us: f64,

    codes: HashMap<u16, u64>,
    errors: HashMap<ErrorKind, u64>,

    bytes_in: u64,
    bytes_out: u64,

    series: RollingSeries,
}

// ─── StreamReport impl ───────────────────────────────────────────

impl StreamReport {
    /// `interval` is the rolling-series bucket width; zero falls back
    /// to one second. The start timestamp is anchored here, so build
    /// the report right before starting the requester.
    pub fn new(interval: Duration) -> Self {
        let width = if interval.is_zero() {
            DEFAULT_SERIES_WIDTH
        } else {
            interval
        };
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner::new(Instant::now(), width)),
            done_tx,
            _done_rx: done_rx,
        }
    }

    /// Consume outcomes until the recorder closes, then publish Done.
    /// The mutex is held per outcome only; snapshot readers interleave
    /// freely.
    pub async fn collect(&self, mut rx: mpsc::Receiver<RequestOutcome>) {
        while let Some(outcome) = rx.recv().await {
            let t_recv = Instant::now();
            self.inner.lock().record(outcome, t_recv);
        }
        self.inner.lock().completed_at = Some(Instant::now());
        self.done_tx.send_replace(true);
    }

    /// Produce an immutable snapshot; callable from any task.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot()
    }

    /// Completion flag, true once after the final drain.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}

// ─── Inner impl ──────────────────────────────────────────────────

impl Inner {
    fn new(t0: Instant, width: Duration) -> Self {
        Self {
            t0,
            completed_at: None,
            total: 0,
            succeeded: 0,
            failed: 0,
            hist: LatencyHistogram::new(),
            err_hist: LatencyHistogram::new(),
            lat_min_us: u64::MAX,
            lat_max_us: 0,
            lat_sum_us: 0.0,
            lat_sum_sq_us: 0.0,
            codes: HashMap::new(),
            errors: HashMap::new(),
            bytes_in: 0,
            bytes_out: 0,
            series: RollingSeries::new(width),
        }
    }

    fn record(&mut self, outcome: RequestOutcome, t_recv: Instant) {
        self.total += 1;

        let us = outcome.latency.as_micros().min(u64::MAX as u128) as u64;
        let idx = self.series.index_of(t_recv.saturating_duration_since(self.t0));
        self.series.record(idx, us, !outcome.is_success());

        // Partial bytes count even for failed attempts
        self.bytes_in += outcome.bytes_read;
        self.bytes_out += outcome.bytes_written;

        match outcome.err {
            Some(kind) => {
                self.failed += 1;
                *self.errors.entry(kind).or_insert(0) += 1;
                // Error latencies get their own view and never enter
                // the success histogram
                self.err_hist.record(outcome.latency);
            }
            None => {
                self.succeeded += 1;
                self.hist.record(outcome.latency);
                self.lat_min_us = self.lat_min_us.min(us);
                self.lat_max_us = self.lat_max_us.max(us);
                self.lat_sum_us += us as f64;
                self.lat_sum_sq_us += (us as f64) * (us as f64);
                *self.codes.entry(outcome.status).or_insert(0) += 1;
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        let elapsed = self
            .completed_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.t0);
        let elapsed_secs = elapsed.as_secs_f64();

        let rps = if elapsed_secs > 0.0 {
            self.total as f64 / elapsed_secs
        } else {
            0.0
        };
        let error_rate = if self.total > 0 {
            self.failed as f64 / self.total as f64
        } else {
            0.0
        };

        Snapshot {
            elapsed_secs,
            finished: self.completed_at.is_some(),
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            rps,
            error_rate,
            latency: self.latency_stats(),
            error_latency: LatencyStats::from_histogram(&self.err_hist),
            codes: self.codes.clone(),
            errors: self.errors.clone(),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            interval_secs: self.series.width().as_secs_f64(),
            series: self.series.window(SNAPSHOT_WINDOW),
            histogram: self.hist.display_buckets(),
        }
    }

    /// Success latency stats from the running moments; quantiles from
    /// the cumulative histogram.
    fn latency_stats(&self) -> LatencyStats {
        let n = self.succeeded;
        if n == 0 {
            return LatencyStats::empty();
        }
        let mean = self.lat_sum_us / n as f64;
        let variance = (self.lat_sum_sq_us / n as f64 - mean * mean).max(0.0);
        // Quantiles come from bucket upper bounds; clamp to the exact
        // observed max so the ordering p50 <= .. <= max always holds
        let q = |q: f64| (self.hist.quantile(q).as_micros() as u64).min(self.lat_max_us);
        LatencyStats {
            count: n,
            min_us: self.lat_min_us,
            max_us: self.lat_max_us,
            mean_us: mean,
            stdev_us: variance.sqrt(),
            p50_us: q(0.5),
            p75_us: q(0.75),
            p90_us: q(0.9),
            p95_us: q(0.95),
            p99_us: q(0.99),
            p999_us: q(0.999),
        }
    }
}

impl LatencyStats {
    pub fn empty() -> Self {
        Self {
            count: 0,
            min_us: 0,
            max_us: 0,
            mean_us: 0.0,
            stdev_us: 0.0,
            p50_us: 0,
            p75_us: 0,
            p90_us: 0,
            p95_us: 0,
            p99_us: 0,
            p999_us: 0,
        }
    }

    pub fn from_histogram(hist: &LatencyHistogram) -> Self {
        if hist.count() == 0 {
            return Self::empty();
        }
        Self {
            count: hist.count(),
            min_us: hist.min().as_micros() as u64,
            max_us: hist.max().as_micros() as u64,
            mean_us: hist.mean_us(),
            stdev_us: hist.stdev_us(),
            p50_us: hist.quantile(0.5).as_micros() as u64,
            p75_us: hist.quantile(0.75).as_micros() as u64,
            p90_us: hist.quantile(0.9).as_micros() as u64,
            p95_us: hist.quantile(0.95).as_micros() as u64,
            p99_us: hist.quantile(0.99).as_micros() as u64,
            p999_us: hist.quantile(0.999).as_micros() as u64,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ok(status: u16, latency_ms: u64) -> RequestOutcome {
        RequestOutcome {
            latency: Duration::from_millis(latency_ms),
            status,
            err: None,
            bytes_written: 100,
            bytes_read: 500,
        }
    }

    fn fail(kind: ErrorKind, latency_ms: u64) -> RequestOutcome {
        RequestOutcome {
            latency: Duration::from_millis(latency_ms),
            status: 0,
            err: Some(kind),
            bytes_written: 100,
            bytes_read: 0,
        }
    }

    fn assert_consistent(s: &Snapshot) {
        assert_eq!(s.total, s.succeeded + s.failed);
        assert_eq!(s.codes.values().sum::<u64>(), s.succeeded);
        assert_eq!(s.errors.values().sum::<u64>(), s.failed);
        assert_eq!(s.histogram.iter().map(|b| b.count).sum::<u64>(), s.succeeded);
        if s.succeeded >= 1 {
            assert!(s.latency.min_us as f64 <= s.latency.mean_us);
            assert!(s.latency.mean_us <= s.latency.max_us as f64);
            assert!(s.latency.stdev_us >= 0.0);
            assert!(s.latency.p50_us <= s.latency.p90_us);
            assert!(s.latency.p90_us <= s.latency.p99_us);
            assert!(s.latency.p99_us <= s.latency.max_us);
        }
    }

    async fn run_collect(outcomes: Vec<RequestOutcome>) -> Arc<StreamReport> {
        let report = Arc::new(StreamReport::new(Duration::from_millis(200)));
        let (tx, rx) = mpsc::channel(8);
        let collector = {
            let report = report.clone();
            tokio::spawn(async move { report.collect(rx).await })
        };
        for o in outcomes {
            tx.send(o).await.unwrap();
        }
        drop(tx);
        collector.await.unwrap();
        report
    }

    #[tokio::test]
    async fn counters_split_between_success_and_failure() {
        let report = run_collect(vec![
            ok(200, 10),
            ok(500, 20),
            fail(ErrorKind::Timeout, 30),
            ok(404, 5),
        ])
        .await;
        let s = report.snapshot();

        assert_eq!(s.total, 4);
        assert_eq!(s.succeeded, 3);
        assert_eq!(s.failed, 1);
        assert_eq!(s.codes[&200], 1);
        assert_eq!(s.codes[&500], 1);
        assert_eq!(s.codes[&404], 1);
        assert_eq!(s.errors[&ErrorKind::Timeout], 1);
        assert_consistent(&s);
    }

    #[tokio::test]
    async fn error_latency_is_kept_out_of_the_success_histogram() {
        let report = run_collect(vec![ok(200, 10), fail(ErrorKind::Connect, 999)]).await;
        let s = report.snapshot();

        assert_eq!(s.latency.count, 1);
        assert_eq!(s.error_latency.count, 1);
        assert!(s.latency.max_us < 900_000);
        assert!(s.error_latency.max_us >= 990_000);
    }

    #[tokio::test]
    async fn bytes_accumulate_for_failures_too() {
        let report = run_collect(vec![ok(200, 1), fail(ErrorKind::Read, 1)]).await;
        let s = report.snapshot();
        assert_eq!(s.bytes_out, 200);
        assert_eq!(s.bytes_in, 500);
    }

    #[tokio::test]
    async fn done_fires_after_drain_and_snapshots_freeze() {
        let report = run_collect(vec![ok(200, 10), ok(200, 20)]).await;

        let mut done = report.done();
        done.wait_for(|d| *d).await.unwrap();

        let a = report.snapshot();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = report.snapshot();
        assert!(a.finished);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_run_produces_a_well_formed_snapshot() {
        let report = run_collect(vec![]).await;
        let s = report.snapshot();
        assert_eq!(s.total, 0);
        assert!(s.finished);
        assert_eq!(s.latency, LatencyStats::empty());
        assert_consistent(&s);
    }

    #[tokio::test]
    async fn snapshot_serializes_with_stable_error_tags() {
        let report = run_collect(vec![fail(ErrorKind::Dns, 1)]).await;
        let json = serde_json::to_string(&report.snapshot()).unwrap();
        assert!(json.contains("\"dns\""));
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_series_buckets_follow_receive_time() {
        let report = Arc::new(StreamReport::new(Duration::from_millis(200)));
        let (tx, rx) = mpsc::channel(8);
        let collector = {
            let report = report.clone();
            tokio::spawn(async move { report.collect(rx).await })
        };

        tx.send(ok(200, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        tx.send(ok(200, 1)).await.unwrap();
        drop(tx);
        collector.await.unwrap();

        let s = report.snapshot();
        let indices: Vec<u64> = s.series.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(s.series[0].count, 1);
        assert_eq!(s.series[1].count, 0);
        assert_eq!(s.series[2].count, 1);
    }
}
