use std::io::{IsTerminal, Write};
use std::time::Duration;

use crate::metrics::{Snapshot, StreamReport};

// ─── Printer ─────────────────────────────────────────────────────

/// Interval-driven terminal renderer. On a live terminal the report
/// block is rewritten in place with ANSI cursor movement; otherwise
/// (or with `--summary`) only the final report is printed.
pub struct Printer {
    clean: bool,
    seconds: bool,
    interactive: bool,
}

impl Printer {
    pub fn new(clean: bool, summary: bool, seconds: bool) -> Self {
        Self {
            clean,
            seconds,
            interactive: std::io::stdout().is_terminal() && !summary,
        }
    }

    /// Render until the report signals Done, then print the final
    /// block. `interval` of zero prints only the final block.
    pub async fn print_loop(&self, report: &StreamReport, interval: Duration) {
        let mut done = report.done();
        let mut last_lines = 0usize;

        if self.interactive && !interval.is_zero() {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        last_lines = self.render(&report.snapshot(), last_lines, true);
                    }
                    r = done.wait_for(|d| *d) => {
                        let _ = r;
                        break;
                    }
                }
            }
        } else {
            let _ = done.wait_for(|d| *d).await;
        }

        self.render(&report.snapshot(), last_lines, false);
    }

    /// Print one report block; returns the number of lines written so
    /// the next pass can rewind over them.
    fn render(&self, s: &Snapshot, last_lines: usize, live: bool) -> usize {
        let mut block = String::new();
        self.write_summary(&mut block, s);
        self.write_statistics(&mut block, s);
        self.write_percentiles(&mut block, s);
        // --clean drops the bars from the final block
        if live || !self.clean {
            self.write_histogram(&mut block, s);
        }
        if !live {
            self.write_codes(&mut block, s);
        }
        self.write_errors(&mut block, s);

        let mut out = std::io::stdout().lock();
        if self.interactive && last_lines > 0 {
            // Rewind over the previous block and clear to the end
            let _ = write!(out, "\x1b[{last_lines}A\r\x1b[J");
        }
        let _ = out.write_all(block.as_bytes());
        let _ = out.flush();
        block.lines().count()
    }

    // ─── Sections ────────────────────────────────────────────────

    fn write_summary(&self, w: &mut String, s: &Snapshot) {
        w.push_str("Summary:\n");
        w.push_str(&format!("  Elapsed  {:>9}\n", self.fmt_secs(s.elapsed_secs)));
        w.push_str(&format!("  Count    {:>9}\n", s.total));
        for (class, label) in [(1u16, "1xx"), (2, "2xx"), (3, "3xx"), (4, "4xx"), (5, "5xx")] {
            let count: u64 = s
                .codes
                .iter()
                .filter(|(code, _)| **code / 100 == class)
                .map(|(_, n)| n)
                .sum();
            if count > 0 {
                w.push_str(&format!("    {label}    {count:>9}\n"));
            }
        }
        w.push_str(&format!("  RPS      {:>9.3}\n", s.rps));
        w.push_str(&format!(
            "  Reads    {:>7}/s\n",
            fmt_bytes(s.bytes_in as f64 / s.elapsed_secs.max(f64::EPSILON))
        ));
        w.push_str(&format!(
            "  Writes   {:>7}/s\n",
            fmt_bytes(s.bytes_out as f64 / s.elapsed_secs.max(f64::EPSILON))
        ));
        w.push('\n');
    }

    fn write_statistics(&self, w: &mut String, s: &Snapshot) {
        w.push_str(&format!(
            "{:<12}{:>10}{:>11}{:>11}{:>11}\n",
            "Statistics", "Min", "Mean", "StdDev", "Max"
        ));
        w.push_str(&format!(
            "  {:<10}{:>10}{:>11}{:>11}{:>11}\n",
            "Latency",
            self.fmt_us(s.latency.min_us as f64),
            self.fmt_us(s.latency.mean_us),
            self.fmt_us(s.latency.stdev_us),
            self.fmt_us(s.latency.max_us as f64),
        ));
        if let Some((min, mean, stdev, max)) = rps_stats(s) {
            w.push_str(&format!(
                "  {:<10}{:>10.2}{:>11.2}{:>11.2}{:>11.2}\n",
                "RPS", min, mean, stdev, max
            ));
        }
        w.push('\n');
    }

    fn write_percentiles(&self, w: &mut String, s: &Snapshot) {
        w.push_str("Latency Percentile:\n");
        let l = &s.latency;
        let cells = [
            ("P50", l.p50_us),
            ("P75", l.p75_us),
            ("P90", l.p90_us),
            ("P95", l.p95_us),
            ("P99", l.p99_us),
            ("P99.9", l.p999_us),
        ];
        let mut head = String::from(" ");
        let mut row = String::from(" ");
        for (name, value) in cells {
            head.push_str(&format!(" {name:<9}"));
            row.push_str(&format!(" {:<9}", self.fmt_us(value as f64)));
        }
        w.push_str(&head);
        w.push('\n');
        w.push_str(&row);
        w.push_str("\n\n");
    }

    fn write_histogram(&self, w: &mut String, s: &Snapshot) {
        if s.histogram.is_empty() {
            return;
        }
        w.push_str("Latency Histogram:\n");
        let peak = s.histogram.iter().map(|b| b.count).max().unwrap_or(1);
        for bucket in &s.histogram {
            let bar = "\u{25a0}".repeat(((bucket.count * 24) / peak.max(1)).max(1) as usize);
            w.push_str(&format!(
                "  {:>9}  {:>9}  \x1b[32m{bar}\x1b[0m\n",
                self.fmt_us(bucket.hi_us as f64),
                bucket.count,
            ));
        }
        w.push('\n');
    }

    /// Final-report breakdown of the most frequent status codes.
    fn write_codes(&self, w: &mut String, s: &Snapshot) {
        if s.codes.is_empty() {
            return;
        }
        let mut codes: Vec<_> = s.codes.iter().collect();
        codes.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        w.push_str("Status Codes:\n");
        for (code, count) in codes.into_iter().take(8) {
            w.push_str(&format!("  [{code}]  {count} responses\n"));
        }
        w.push('\n');
    }

    fn write_errors(&self, w: &mut String, s: &Snapshot) {
        if s.errors.is_empty() {
            return;
        }
        w.push_str("Errors:\n");
        let mut tags: Vec<_> = s.errors.iter().collect();
        tags.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (kind, count) in tags {
            w.push_str(&format!("  \x1b[31m{:<10}\x1b[0m{count:>9}\n", kind.as_str()));
        }
        w.push('\n');
    }

    // ─── Formatting ──────────────────────────────────────────────

    fn fmt_us(&self, us: f64) -> String {
        if self.seconds {
            return format!("{:.6}", us / 1_000_000.0);
        }
        fmt_duration_us(us)
    }

    fn fmt_secs(&self, secs: f64) -> String {
        if self.seconds {
            return format!("{secs:.1}s");
        }
        fmt_duration_us(secs * 1_000_000.0)
    }
}

/// Per-interval RPS statistics over the completed series buckets; the
/// trailing (partial) bucket is excluded.
fn rps_stats(s: &Snapshot) -> Option<(f64, f64, f64, f64)> {
    if s.interval_secs <= 0.0 || s.series.len() < 2 {
        return None;
    }
    let complete = &s.series[..s.series.len() - 1];
    let rates: Vec<f64> = complete
        .iter()
        .map(|p| p.count as f64 / s.interval_secs)
        .collect();
    if rates.is_empty() {
        return None;
    }
    let n = rates.len() as f64;
    let mean = rates.iter().sum::<f64>() / n;
    let var = rates.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
    let min = rates.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = rates.iter().cloned().fold(0.0f64, f64::max);
    Some((min, mean, var.sqrt(), max))
}

fn fmt_duration_us(us: f64) -> String {
    if us < 1_000.0 {
        format!("{}\u{b5}s", us.round() as u64)
    } else if us < 1_000_000.0 {
        format!("{:.2}ms", us / 1_000.0)
    } else {
        format!("{:.2}s", us / 1_000_000.0)
    }
}

fn fmt_bytes(per_sec: f64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = per_sec;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

// ─── Tests ───────────────────────────────────────────────────────
