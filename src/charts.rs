use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::metrics::{Snapshot, StreamReport};

// ─── State ───────────────────────────────────────────────────────

/// Everything the chart endpoints need: the live report, the run
/// description for the page title, and the push cadence.
pub struct ChartsState {
    report: Arc<StreamReport>,
    desc: String,
    interval: Duration,
}

impl ChartsState {
    pub fn new(report: Arc<StreamReport>, desc: String, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        Self {
            report,
            desc,
            interval,
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────

pub fn router(state: Arc<ChartsState>) -> Router {
    Router::new()
        // ── Chart page ──────────────────────────────────────────
        .route("/", get(index))
        // ── One-shot JSON feed: snapshot + rolling window ───────
        .route("/data", get(data))
        // ── Push feed at the snapshot cadence ───────────────────
        .route("/stream", get(stream))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind-and-serve; the listener is bound by the caller before the run
/// starts so bind failures are fatal at startup, not mid-run.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<ChartsState>, auto_open: bool) {
    if auto_open {
        if let Ok(addr) = listener.local_addr() {
            open_browser(&format!("http://{addr}"));
        }
    }
    if let Err(e) = axum::serve(listener, router(state)).await {
        warn!("charts server exited: {e}");
    }
}

// ─── Handlers ────────────────────────────────────────────────────

async fn index(State(state): State<Arc<ChartsState>>) -> Html<String> {
    Html(
        CHARTS_PAGE
            .replace("__TITLE__", &state.desc)
            .replace("__INTERVAL_MS__", &state.interval.as_millis().to_string()),
    )
}

async fn data(State(state): State<Arc<ChartsState>>) -> Json<Snapshot> {
    Json(state.report.snapshot())
}

async fn stream(
    State(state): State<Arc<ChartsState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(state.interval);
    let stream = IntervalStream::new(interval).map(move |_| {
        let snapshot = state.report.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

// ─── Browser launch ──────────────────────────────────────────────

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let program = "open";
    #[cfg(target_os = "windows")]
    let program = "explorer";
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let program = "xdg-open";

    if let Err(e) = std::process::Command::new(program).arg(url).spawn() {
        warn!("failed to open browser: {e}");
    }
}

// ─── Embedded page ───────────────────────────────────────────────

/// Self-contained chart page: subscribes to /stream and draws the
/// latency percentiles and RPS over the rolling series.
const CHARTS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>__TITLE__</title>
<script src="https://cdn.jsdelivr.net/npm/echarts@5/dist/echarts.min.js"></script>
<style>
  body { margin: 0; font-family: system-ui, sans-serif; background: #fafafa; }
  h1 { font-size: 16px; font-weight: 500; padding: 12px 16px; margin: 0; }
  .chart { width: 100%; height: 320px; }
  #stats { padding: 4px 16px 12px; color: #555; font-size: 13px; }
</style>
</head>
<body>
<h1>__TITLE__</h1>
<div id="stats"></div>
<div id="latency" class="chart"></div>
<div id="rps" class="chart"></div>
<script>
const latencyChart = echarts.init(document.getElementById('latency'));
const rpsChart = echarts.init(document.getElementById('rps'));
const intervalSec = __INTERVAL_MS__ / 1000;

function ms(us) { return +(us / 1000).toFixed(2); }

function draw(s) {
  const x = s.series.map(p => (p.index * intervalSec).toFixed(1) + 's');
  latencyChart.setOption({
    title: { text: 'Latency (ms)', left: 'center', textStyle: { fontSize: 13 } },
    tooltip: { trigger: 'axis' },
    legend: { bottom: 0 },
    xAxis: { type: 'category', data: x },
    yAxis: { type: 'value' },
    series: [
      { name: 'p50', type: 'line', showSymbol: false, data: s.series.map(p => ms(p.p50_us)) },
      { name: 'p90', type: 'line', showSymbol: false, data: s.series.map(p => ms(p.p90_us)) },
      { name: 'p99', type: 'line', showSymbol: false, data: s.series.map(p => ms(p.p99_us)) },
    ],
  });
  rpsChart.setOption({
    title: { text: 'Requests per second', left: 'center', textStyle: { fontSize: 13 } },
    tooltip: { trigger: 'axis' },
    legend: { bottom: 0 },
    xAxis: { type: 'category', data: x },
    yAxis: { type: 'value' },
    series: [
      { name: 'rps', type: 'line', showSymbol: false, areaStyle: {}, data: s.series.map(p => +(p.count / intervalSec).toFixed(1)) },
      { name: 'errors/s', type: 'line', showSymbol: false, data: s.series.map(p => +(p.errors / intervalSec).toFixed(1)) },
    ],
  });
  document.getElementById('stats').textContent =
    'total ' + s.total + '  |  rps ' + s.rps.toFixed(1) +
    '  |  error rate ' + (s.error_rate * 100).toFixed(2) + '%' +
    (s.finished ? '  |  finished' : '');
}

const source = new EventSource('/stream');
source.onmessage = e => draw(JSON.parse(e.data));
</script>
</body>
</html>
"#;
