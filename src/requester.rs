use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::client::{Client, ErrorKind, Reply};
use crate::metrics::RequestOutcome;

// ─── Configuration ───────────────────────────────────────────────

/// Recorder queue capacity per worker. Bounded so a stalled consumer
/// backpressures instead of growing without limit.
const QUEUE_PER_WORKER: usize = 8;

/// Upper bound on how long an in-flight request may keep running after
/// the stop signal.
const MAX_GRACE: Duration = Duration::from_secs(5);

// ─── Requester ───────────────────────────────────────────────────

/// Drives N concurrent workers against the shared client, gated by a
/// request budget and/or a deadline, and emits one `RequestOutcome`
/// per attempt into the recorder channel. Closing the channel is this
/// type's job alone: it happens after every worker has returned.
pub struct Requester {
    concurrency: u32,
    /// Total request budget; negative means unlimited
    requests: i64,
    /// Wall-clock cap; zero means unlimited
    duration: Duration,
    client: Arc<dyn Client>,
    tx: mpsc::Sender<RequestOutcome>,
    stop: Arc<watch::Sender<bool>>,
    grace: Duration,
}

impl Requester {
    /// Returns the requester and the receive side of the recorder
    /// channel, to be handed to `StreamReport::collect`.
    pub fn new(
        concurrency: u32,
        requests: i64,
        duration: Duration,
        timeout: Option<Duration>,
        client: Arc<dyn Client>,
    ) -> (Self, mpsc::Receiver<RequestOutcome>) {
        let cap = (concurrency as usize).max(1) * QUEUE_PER_WORKER;
        let (tx, rx) = mpsc::channel(cap);
        let (stop, _) = watch::channel(false);
        let grace = timeout.map(|t| t.min(MAX_GRACE)).unwrap_or(MAX_GRACE);
        (
            Self {
                concurrency: concurrency.max(1),
                requests,
                duration,
                client,
                tx,
                stop: Arc::new(stop),
                grace,
            },
            rx,
        )
    }

    /// Handle for triggering a stop from outside (Ctrl-C, tests).
    /// Triggering is idempotent.
    pub fn stop_signal(&self) -> Arc<watch::Sender<bool>> {
        self.stop.clone()
    }

    /// Run the full lifecycle: spawn workers, arm the deadline, wait
    /// for every worker to return, then close the recorder.
    pub async fn run(self) {
        let deadline = (!self.duration.is_zero()).then(|| Instant::now() + self.duration);
        let budget = Arc::new(AtomicI64::new(self.requests));
        let unlimited = self.requests < 0;

        // The deadline publishes the stop signal so in-flight requests
        // get cancelled, not just new ones gated
        let timer = deadline.map(|at| {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                stop.send_replace(true);
            })
        });

        let mut handles = Vec::with_capacity(self.concurrency as usize);
        for _ in 0..self.concurrency {
            let client = self.client.clone();
            let tx = self.tx.clone();
            let budget = budget.clone();
            let stop_rx = self.stop.subscribe();
            let grace = self.grace;
            handles.push(tokio::spawn(async move {
                worker(client, tx, budget, unlimited, deadline, stop_rx, grace).await;
            }));
        }

        // Only worker clones keep the channel open from here on
        drop(self.tx);

        for h in handles {
            let _ = h.await;
        }
        if let Some(t) = timer {
            t.abort();
        }
        debug!("all workers drained");
    }
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(
    client: Arc<dyn Client>,
    tx: mpsc::Sender<RequestOutcome>,
    budget: Arc<AtomicI64>,
    unlimited: bool,
    deadline: Option<Instant>,
    mut stop_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        // No new request starts past the deadline even if the stop
        // signal has not been observed yet
        if let Some(at) = deadline {
            if Instant::now() >= at {
                break;
            }
        }
        // Work token: the pre-decrement value must cover this attempt
        if !unlimited && budget.fetch_sub(1, Ordering::AcqRel) < 1 {
            break;
        }

        let start = Instant::now();
        let reply = tokio::select! {
            reply = client.perform() => reply,
            _ = stopped_for(&mut stop_rx, grace) => Reply {
                status: 0,
                bytes_written: 0,
                bytes_read: 0,
                err: Some(ErrorKind::Cancelled),
            },
        };

        let outcome = RequestOutcome {
            latency: start.elapsed(),
            status: reply.status,
            err: reply.err,
            bytes_written: reply.bytes_written,
            bytes_read: reply.bytes_read,
        };
        // The requester closes the channel only after all workers have
        // returned, so a failed send means the aggregator died
        tx.send(outcome)
            .await
            .expect("recorder closed while workers still running");
    }
}

/// Resolves once the stop signal has been set for at least `grace`.
/// Racing this against the in-flight call gives it the grace window
/// before it is cancelled at the transport layer.
async fn stopped_for(stop_rx: &mut watch::Receiver<bool>, grace: Duration) {
    if stop_rx.wait_for(|stopped| *stopped).await.is_err() {
        // Stop sender gone without a signal: nothing to race against
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StreamReport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic stand-in for the HTTP transport. Behavior per
    /// call is chosen by `script` from the call sequence number.
    struct StubClient<F>
    where
        F: Fn(usize) -> Reply + Send + Sync,
    {
        latency: Duration,
        calls: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
        script: F,
    }

    impl<F> StubClient<F>
    where
        F: Fn(usize) -> Reply + Send + Sync,
    {
        fn new(latency: Duration, script: F) -> Arc<Self> {
            Arc::new(Self {
                latency,
                calls: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
                script,
            })
        }
    }

    #[async_trait]
    impl<F> Client for StubClient<F>
    where
        F: Fn(usize) -> Reply + Send + Sync,
    {
        async fn perform(&self) -> Reply {
            let seq = self.calls.fetch_add(1, Ordering::SeqCst);
            self.starts.lock().push(Instant::now());
            tokio::time::sleep(self.latency).await;
            (self.script)(seq)
        }
    }

    fn ok(status: u16) -> Reply {
        Reply {
            status,
            bytes_written: 100,
            bytes_read: 1000,
            err: None,
        }
    }

    fn errored(kind: ErrorKind) -> Reply {
        Reply {
            status: 0,
            bytes_written: 100,
            bytes_read: 0,
            err: Some(kind),
        }
    }

    async fn drive(
        concurrency: u32,
        requests: i64,
        duration: Duration,
        client: Arc<dyn Client>,
    ) -> Arc<StreamReport> {
        let (requester, rx) = Requester::new(concurrency, requests, duration, None, client);
        let report = Arc::new(StreamReport::new(Duration::from_millis(200)));
        let collector = {
            let report = report.clone();
            tokio::spawn(async move { report.collect(rx).await })
        };
        requester.run().await;
        collector.await.unwrap();
        report
    }

    fn assert_invariants(s: &crate::metrics::Snapshot) {
        assert_eq!(s.total, s.succeeded + s.failed);
        assert_eq!(s.codes.values().sum::<u64>(), s.succeeded);
        assert_eq!(s.errors.values().sum::<u64>(), s.failed);
        assert_eq!(s.histogram.iter().map(|b| b.count).sum::<u64>(), s.succeeded);
        if s.succeeded >= 1 {
            assert!(s.latency.min_us as f64 <= s.latency.mean_us);
            assert!(s.latency.mean_us <= s.latency.max_us as f64);
            assert!(s.latency.p50_us <= s.latency.p90_us);
            assert!(s.latency.p90_us <= s.latency.p99_us);
            assert!(s.latency.p99_us <= s.latency.max_us);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_completes_immediately_with_empty_report() {
        let client = StubClient::new(Duration::from_millis(1), |_| ok(200));
        let report = drive(1, 0, Duration::ZERO, client.clone()).await;

        let mut done = report.done();
        done.wait_for(|d| *d).await.unwrap();

        let s = report.snapshot();
        assert_eq!(s.total, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_total_and_latency_lands_in_one_bucket() {
        let client = StubClient::new(Duration::from_millis(10), |_| ok(200));
        let report = drive(4, 100, Duration::ZERO, client).await;

        let s = report.snapshot();
        assert_eq!(s.total, 100);
        assert_eq!(s.succeeded, 100);
        assert_eq!(s.codes[&200], 100);
        // All observations share the 10 ms value, so a single display
        // bucket holds every count and the tail stays tight
        let full: Vec<_> = s.histogram.iter().filter(|b| b.count > 0).collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].count, 100);
        assert!(s.latency.p99_us <= 12_000);
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_new_requests_and_series_stays_contiguous() {
        let client = StubClient::new(Duration::from_millis(1), |_| ok(200));
        let t0 = Instant::now();
        let report = drive(10, -1, Duration::from_secs(1), client.clone()).await;

        // No request started past the deadline
        let last_start = *client.starts.lock().last().unwrap();
        assert!(last_start < t0 + Duration::from_secs(1));

        let s = report.snapshot();
        assert_eq!(s.total as usize, client.calls.load(Ordering::SeqCst));
        let indices: Vec<u64> = s.series.iter().map(|p| p.index).collect();
        for w in indices.windows(2) {
            assert_eq!(w[1], w[0] + 1);
        }
        // 1 s of work at 200 ms intervals; completions recorded at the
        // deadline edge may spill one bucket past the five
        let non_empty = s.series.iter().filter(|p| p.count > 0).count();
        assert!((5..=6).contains(&non_empty), "non_empty = {non_empty}");
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn alternating_status_codes_all_count_as_success() {
        let client = StubClient::new(Duration::from_millis(1), |seq| {
            if seq % 2 == 0 {
                ok(200)
            } else {
                ok(500)
            }
        });
        let report = drive(2, 50, Duration::ZERO, client).await;

        let s = report.snapshot();
        assert_eq!(s.total, 50);
        assert_eq!(s.succeeded, 50);
        assert_eq!(s.failed, 0);
        assert_eq!(s.codes[&200], 25);
        assert_eq!(s.codes[&500], 25);
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn tagged_errors_split_the_tallies() {
        let client = StubClient::new(Duration::from_millis(1), |seq| {
            if seq % 2 == 0 {
                ok(200)
            } else {
                errored(ErrorKind::Timeout)
            }
        });
        let report = drive(2, 50, Duration::ZERO, client).await;

        let s = report.snapshot();
        assert_eq!(s.total, 50);
        assert_eq!(s.succeeded, 25);
        assert_eq!(s.failed, 25);
        assert_eq!(s.errors[&ErrorKind::Timeout], 25);
        assert_eq!(s.histogram.iter().map(|b| b.count).sum::<u64>(), 25);
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_under_load_always_satisfy_invariants() {
        let client = StubClient::new(Duration::from_micros(50), |_| ok(200));
        let (requester, rx) = Requester::new(8, 10_000, Duration::ZERO, None, client);
        let report = Arc::new(StreamReport::new(Duration::from_millis(200)));

        let collector = {
            let report = report.clone();
            tokio::spawn(async move { report.collect(rx).await })
        };
        let observer = {
            let report = report.clone();
            tokio::spawn(async move {
                let mut last = report.snapshot();
                for _ in 0..1000 {
                    last = report.snapshot();
                    assert_invariants(&last);
                    tokio::time::sleep(Duration::from_micros(37)).await;
                }
                last
            })
        };

        requester.run().await;
        collector.await.unwrap();
        observer.await.unwrap();

        let s = report.snapshot();
        assert_eq!(s.total, 10_000);
        // Post-completion snapshots are frozen
        assert_eq!(s, report.snapshot());
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_cancels_in_flight_after_grace() {
        // A transport that never returns: only the grace path can end it
        let client = StubClient::new(Duration::from_secs(3600), |_| ok(200));
        let (requester, rx) =
            Requester::new(2, -1, Duration::ZERO, Some(Duration::from_millis(100)), client);
        let stop = requester.stop_signal();
        let report = Arc::new(StreamReport::new(Duration::from_millis(200)));
        let collector = {
            let report = report.clone();
            tokio::spawn(async move { report.collect(rx).await })
        };

        let run = tokio::spawn(requester.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.send_replace(true);
        run.await.unwrap();
        collector.await.unwrap();

        let s = report.snapshot();
        assert_eq!(s.total, 2);
        assert_eq!(s.failed, 2);
        assert_eq!(s.errors[&ErrorKind::Cancelled], 2);
        // Cancellation happened at stop + grace, not at the transport's
        // one-hour horizon
        assert!(s.latency.count == 0);
        assert!(s.error_latency.max_us < 200_000);
        assert_invariants(&s);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_never_exceeded_under_contention() {
        let client = StubClient::new(Duration::from_micros(10), |_| ok(200));
        let report = drive(16, 37, Duration::ZERO, client.clone()).await;

        let s = report.snapshot();
        assert_eq!(s.total, 37);
        assert_eq!(client.calls.load(Ordering::SeqCst), 37);
    }
}
