use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::client::BodySource;

/// A high-performance HTTP benchmarking tool with a real-time web UI
/// and terminal displaying.
#[derive(Parser, Debug)]
#[command(
    name = "barrage",
    version,
    about = "A high-performance HTTP benchmarking tool with real-time web UI and terminal displaying",
    after_help = "Flags default values also read from env BARRAGE_SOME_FLAG, \
                  such as BARRAGE_TIMEOUT=5s equals to --timeout=5s.\n\n\
                  Examples:\n\n  \
                  barrage http://127.0.0.1:8080/ -c 20 -n 100000\n  \
                  barrage https://httpbin.org/post -c 20 -d 5m --body @file.json -T 'application/json' -m POST"
)]
pub struct Args {
    /// Number of connections to run concurrently
    #[arg(short, long, default_value_t = 1, env = "BARRAGE_CONCURRENCY")]
    pub concurrency: u32,

    /// Number of requests to run, negative means unlimited
    #[arg(
        short = 'n',
        long,
        default_value_t = -1,
        allow_hyphen_values = true,
        env = "BARRAGE_REQUESTS"
    )]
    pub requests: i64,

    /// Duration of test, examples: -d 10s -d 3m
    #[arg(short, long, value_parser = parse_duration, value_name = "DURATION", env = "BARRAGE_DURATION")]
    pub duration: Option<Duration>,

    /// Print snapshot result every interval, use 0 to print once at the end
    #[arg(short, long, default_value = "200ms", value_parser = parse_duration, env = "BARRAGE_INTERVAL")]
    pub interval: Duration,

    /// Use seconds as time unit to print
    #[arg(long, env = "BARRAGE_SECONDS")]
    pub seconds: bool,

    /// HTTP request body, if start the body with @, the rest should be a filename to read
    #[arg(short, long, env = "BARRAGE_BODY")]
    pub body: Option<String>,

    /// Stream the file specified by '--body @file' using chunked encoding instead of reading into memory
    #[arg(long, env = "BARRAGE_STREAM")]
    pub stream: bool,

    /// HTTP method
    #[arg(short, long, default_value = "GET", env = "BARRAGE_METHOD")]
    pub method: String,

    /// Custom HTTP headers
    #[arg(
        short = 'H',
        long = "header",
        value_name = "K:V",
        value_delimiter = ';',
        env = "BARRAGE_HEADER"
    )]
    pub headers: Vec<String>,

    /// Host header
    #[arg(long, env = "BARRAGE_HOST")]
    pub host: Option<String>,

    /// Content-Type header
    #[arg(short = 'T', long = "content", env = "BARRAGE_CONTENT")]
    pub content: Option<String>,

    /// Path to the client's TLS Certificate
    #[arg(long, env = "BARRAGE_CERT")]
    pub cert: Option<PathBuf>,

    /// Path to the client's TLS Certificate Private Key
    #[arg(long, env = "BARRAGE_KEY")]
    pub key: Option<PathBuf>,

    /// Skip verification of the server's certificate chain and host name
    #[arg(short = 'k', long, env = "BARRAGE_INSECURE")]
    pub insecure: bool,

    /// Timeout for each http request
    #[arg(long, value_parser = parse_duration, value_name = "DURATION", env = "BARRAGE_TIMEOUT")]
    pub timeout: Option<Duration>,

    /// Timeout for dial addr
    #[arg(long = "dial-timeout", value_parser = parse_duration, value_name = "DURATION", env = "BARRAGE_DIAL_TIMEOUT")]
    pub dial_timeout: Option<Duration>,

    /// Timeout for full request writing
    #[arg(long = "req-timeout", value_parser = parse_duration, value_name = "DURATION", env = "BARRAGE_REQ_TIMEOUT")]
    pub req_timeout: Option<Duration>,

    /// Timeout for full response reading
    #[arg(long = "resp-timeout", value_parser = parse_duration, value_name = "DURATION", env = "BARRAGE_RESP_TIMEOUT")]
    pub resp_timeout: Option<Duration>,

    /// Socks5 proxy
    #[arg(long, value_name = "ip:port", env = "BARRAGE_SOCKS5")]
    pub socks5: Option<String>,

    /// Listen addr to serve the web charts UI, use an empty value to disable
    #[arg(long, default_value = ":18888", env = "BARRAGE_LISTEN")]
    pub listen: String,

    /// Open a browser automatically once the charts server is listening
    #[arg(long = "auto-open-browser", env = "BARRAGE_AUTO_OPEN_BROWSER")]
    pub auto_open_browser: bool,

    /// Keep the histogram bars in place after the run finishes
    #[arg(long = "no-clean", env = "BARRAGE_NO_CLEAN")]
    pub no_clean: bool,

    /// Only print the summary without realtime reports
    #[arg(long, env = "BARRAGE_SUMMARY")]
    pub summary: bool,

    /// Request url
    #[arg(value_name = "url", required = true)]
    pub url: String,
}

impl Args {
    /// Startup validation; failures here exit with code 1.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.url)?;
        if self.cert.is_some() != self.key.is_some() {
            anyhow::bail!("must specify cert and key at the same time");
        }
        if self.requests >= 0 && (self.requests as u128) < u128::from(self.concurrency) {
            tracing::warn!(
                requests = self.requests,
                concurrency = self.concurrency,
                "request budget is below the worker count; some workers will never run"
            );
        }
        Ok(())
    }

    /// Resolve the `--body` flag into a body source. `@file` reads the
    /// file up front unless `--stream` asks for chunked streaming.
    pub fn body_source(&self) -> anyhow::Result<BodySource> {
        let Some(body) = &self.body else {
            return Ok(BodySource::Empty);
        };
        if let Some(path) = body.strip_prefix('@') {
            let path = PathBuf::from(path);
            if !path.is_file() {
                anyhow::bail!("body file {} not found", path.display());
            }
            if self.stream {
                Ok(BodySource::File(path))
            } else {
                Ok(BodySource::Bytes(std::fs::read(&path)?))
            }
        } else if body.is_empty() {
            Ok(BodySource::Empty)
        } else {
            Ok(BodySource::Bytes(body.clone().into_bytes()))
        }
    }

    pub fn clean(&self) -> bool {
        !self.no_clean
    }
}

/// Parse `10s`, `3m`, `200ms`, `500us`, `1h`; a bare number means
/// seconds and `0` disables the option.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "" | "s" => value,
        "ms" => value / 1_000.0,
        "us" | "µs" => value / 1_000_000.0,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        _ => return Err(format!("invalid duration unit {unit:?}")),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}
