use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

// ─── Configuration ───────────────────────────────────────────────

/// Histogram range: 1 μs → 60 s, 3 significant figures.
/// Memory stays O(buckets) no matter how many requests are recorded,
/// with relative quantile error bounded well under 1%.
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000;
const HIST_SIGFIG: u8 = 3;

/// Pre-defined display edges (μs) for the terminal bar chart and the
/// charts feed. Covers the typical HTTP latency range with good
/// resolution at the low end.
const DISPLAY_EDGES: &[u64] = &[
    100,
    250,
    500,
    1_000,
    2_500,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    2_500_000,
    5_000_000,
    10_000_000,
    30_000_000,
];

// ─── Public types ────────────────────────────────────────────────

/// Fixed-range latency histogram: O(1) insert, bounded-error quantiles,
/// bucket-wise merge. All values are clamped into the configured range,
/// so every recorded observation is counted exactly once.
#[derive(Clone)]
pub struct LatencyHistogram {
    hist: Histogram<u64>,
}

/// One bar of the rendered latency distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayBucket {
    pub lo_us: u64,
    pub hi_us: u64,
    pub count: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            hist: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("histogram creation"),
        }
    }

    /// Place one observation. Out-of-range values clamp to the first or
    /// last bucket.
    pub fn record(&mut self, latency: Duration) {
        let us = (latency.as_micros().min(HIST_HIGH as u128) as u64).max(HIST_LOW);
        self.hist.saturating_record(us);
    }

    /// Upper bound of the bucket containing the q-th cumulative count,
    /// q in [0, 1].
    pub fn quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.hist.value_at_quantile(q))
    }

    /// Bucket-wise addition. Associative and commutative.
    pub fn merge(&mut self, other: &LatencyHistogram) {
        self.hist.add(&other.hist).expect("histogram bounds match");
    }

    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    pub fn min(&self) -> Duration {
        if self.hist.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.hist.min())
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.hist.max())
    }

    pub fn mean_us(&self) -> f64 {
        self.hist.mean()
    }

    pub fn stdev_us(&self) -> f64 {
        self.hist.stdev()
    }

    /// Project the recorded values onto the fixed display edges,
    /// skipping empty buckets. Used for the terminal bars and charts.
    pub fn display_buckets(&self) -> Vec<DisplayBucket> {
        if self.hist.is_empty() {
            return Vec::new();
        }

        let bounds = DISPLAY_EDGES;
        let mut counts = vec![0u64; bounds.len() + 1];

        for iv in self.hist.iter_recorded() {
            let val = iv.value_iterated_to();
            let cnt = iv.count_at_value();

            // binary_search gives the first boundary >= val
            let idx = match bounds.binary_search(&val) {
                Ok(i) => i,
                Err(i) => i,
            };
            counts[idx.min(bounds.len())] += cnt;
        }

        let mut result = Vec::new();
        let mut prev = 0u64;
        for (i, &boundary) in bounds.iter().enumerate() {
            if counts[i] > 0 {
                result.push(DisplayBucket {
                    lo_us: prev,
                    hi_us: boundary,
                    count: counts[i],
                });
            }
            prev = boundary;
        }
        if counts[bounds.len()] > 0 {
            result.push(DisplayBucket {
                lo_us: *bounds.last().unwrap(),
                hi_us: self.hist.max(),
                count: counts[bounds.len()],
            });
        }
        result
    }
}

// ─── Tests ───────────────────────────────────────────────────────
