use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

mod charts;
mod cli;
mod client;
mod metrics;
mod printer;
mod requester;

use client::{ClientOpt, HttpClient};
use metrics::StreamReport;
use printer::Printer;
use requester::Requester;

#[tokio::main]
async fn main() {
    // Logs go to stderr so the live report block on stdout stays intact
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli::Args::parse()).await {
        eprintln!("barrage: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: cli::Args) -> anyhow::Result<()> {
    args.validate()?;
    let body = args.body_source()?;
    let duration = args.duration.unwrap_or_default();

    let client = Arc::new(HttpClient::new(&ClientOpt {
        url: args.url.clone(),
        method: args.method.clone(),
        headers: args.headers.clone(),
        host: args.host.clone(),
        content_type: args.content.clone(),
        body,
        cert: args.cert.clone(),
        key: args.key.clone(),
        insecure: args.insecure,
        max_conns: args.concurrency as usize,
        timeout: args.timeout,
        dial_timeout: args.dial_timeout,
        write_timeout: args.req_timeout,
        read_timeout: args.resp_timeout,
        socks5: args.socks5.clone(),
    })?);

    // ── Run description ─────────────────────────────────────────
    let mut desc = format!("Benchmarking {}", args.url);
    if args.requests > 0 {
        desc.push_str(&format!(" with {} request(s)", args.requests));
    }
    if !duration.is_zero() {
        desc.push_str(&format!(" for {:?}", duration));
    }
    desc.push_str(&format!(" using {} connection(s).", args.concurrency));
    announce(&desc, args.summary);

    // ── Charts listener: bind before the run so failures are fatal
    let listener = if args.listen.is_empty() {
        None
    } else {
        let addr = normalize_listen(&args.listen);
        let ln = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        announce(
            &format!("@ Real-time charts is listening on http://{}", ln.local_addr()?),
            args.summary,
        );
        Some(ln)
    };
    announce("", args.summary);

    // ── Wire the pipeline: workers → recorder → aggregator ──────
    let (requester, record_rx) = Requester::new(
        args.concurrency,
        args.requests,
        duration,
        args.timeout,
        client,
    );
    let report = Arc::new(StreamReport::new(args.interval));

    // Ctrl-C triggers a graceful stop; the run drains and reports
    {
        let stop = requester.stop_signal();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.send_replace(true);
            }
        });
    }

    tokio::spawn(requester.run());
    {
        let report = report.clone();
        tokio::spawn(async move { report.collect(record_rx).await });
    }

    if let Some(ln) = listener {
        let state = Arc::new(charts::ChartsState::new(
            report.clone(),
            desc,
            args.interval,
        ));
        tokio::spawn(charts::serve(ln, state, args.auto_open_browser));
    }

    // ── Terminal report until Done ──────────────────────────────
    let printer = Printer::new(args.clean(), args.summary, args.seconds);
    printer.print_loop(&report, args.interval).await;
    Ok(())
}

/// Progress lines move to stderr in summary mode so stdout carries
/// nothing but the final report.
fn announce(line: &str, summary: bool) {
    if summary {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
}

/// Accept the `:port` shorthand for an all-interfaces bind.
fn normalize_listen(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}
