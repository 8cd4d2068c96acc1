use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Proxy, Url};
use serde::Serialize;
use tokio_util::io::ReaderStream;

// ─── Error taxonomy ──────────────────────────────────────────────

/// Closed set of transport error tags. Surface names are stable — they
/// appear in snapshots, the final report, and the charts feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Name resolution failed
    Dns,
    /// TCP/TLS handshake failed or dial timed out
    Connect,
    /// Request write incomplete or timed out
    Write,
    /// Response read incomplete or timed out
    Read,
    /// Overall per-request timeout expired
    Timeout,
    /// Stop signal or grace-window expiry
    Cancelled,
    /// Malformed response
    Proto,
    /// Anything else the transport surfaces
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Write => "write",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Proto => "proto",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Client capability ───────────────────────────────────────────

/// What a single attempt produced. The worker timestamps around
/// `perform`, so latency is not part of the reply.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    /// HTTP status code, zero when no response was obtained
    pub status: u16,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub err: Option<ErrorKind>,
}

/// Executes one request against the fixed target. Shared read-only by
/// all workers; implementations must be safe under that sharing.
#[async_trait]
pub trait Client: Send + Sync {
    async fn perform(&self) -> Reply;
}

// ─── Options ─────────────────────────────────────────────────────

/// Where the request body comes from.
#[derive(Debug, Clone, Default)]
pub enum BodySource {
    #[default]
    Empty,
    /// In-memory bytes, sent with Content-Length
    Bytes(Vec<u8>),
    /// Re-opened per request and streamed with chunked encoding
    File(PathBuf),
}

/// Immutable client configuration, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ClientOpt {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub host: Option<String>,
    pub content_type: Option<String>,
    pub body: BodySource,

    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub insecure: bool,

    pub max_conns: usize,
    pub timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,

    pub socks5: Option<String>,
}

// ─── reqwest-backed implementation ───────────────────────────────

/// The production `Client`: a pooled reqwest client plus a prepared
/// request template, executed over and over.
pub struct HttpClient {
    inner: reqwest::Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: BodySource,
    write_timeout: Option<Duration>,
    /// Serialized request-head size plus body length, used as the
    /// wire-bytes-out figure for every attempt
    request_bytes: u64,
}

impl HttpClient {
    pub fn new(opt: &ClientOpt) -> anyhow::Result<Self> {
        let url = Url::parse(&opt.url)?;
        let method = Method::from_bytes(opt.method.as_bytes())?;
        let headers = build_headers(opt)?;

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(opt.max_conns.max(1))
            .danger_accept_invalid_certs(opt.insecure);
        if let Some(t) = opt.timeout {
            builder = builder.timeout(t);
        }
        if let Some(t) = opt.dial_timeout {
            builder = builder.connect_timeout(t);
        }
        if let Some(t) = opt.read_timeout {
            builder = builder.read_timeout(t);
        }
        if let Some(addr) = &opt.socks5 {
            builder = builder.proxy(Proxy::all(format!("socks5://{addr}"))?);
        }
        if let (Some(cert), Some(key)) = (&opt.cert, &opt.key) {
            let mut pem = std::fs::read(cert)?;
            pem.extend(std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        let body_len = match &opt.body {
            BodySource::Empty => 0,
            BodySource::Bytes(b) => b.len() as u64,
            BodySource::File(path) => std::fs::metadata(path)?.len(),
        };
        let request_bytes = request_head_bytes(&method, &url, &headers) + body_len;

        Ok(Self {
            inner: builder.build()?,
            method,
            url,
            headers,
            body: opt.body.clone(),
            write_timeout: opt.write_timeout,
            request_bytes,
        })
    }

    fn failure(&self, kind: ErrorKind) -> Reply {
        Reply {
            status: 0,
            bytes_written: 0,
            bytes_read: 0,
            err: Some(kind),
        }
    }
}

#[async_trait]
impl Client for HttpClient {
    async fn perform(&self) -> Reply {
        let mut req = self
            .inner
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());

        req = match &self.body {
            BodySource::Empty => req,
            BodySource::Bytes(b) => req.body(b.clone()),
            BodySource::File(path) => match tokio::fs::File::open(path).await {
                Ok(f) => req.body(reqwest::Body::wrap_stream(ReaderStream::new(f))),
                Err(_) => return self.failure(ErrorKind::Other),
            },
        };

        // Send covers connect + request write + response head. A
        // distinct write deadline is enforced here and classified as
        // `write`; connect and overall deadlines live in the pool.
        let sent = match self.write_timeout {
            Some(limit) => match tokio::time::timeout(limit, req.send()).await {
                Ok(r) => r,
                Err(_) => return self.failure(ErrorKind::Write),
            },
            None => req.send().await,
        };

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => return self.failure(classify(&e, Phase::Send)),
        };

        let status = resp.status().as_u16();
        let head = response_head_bytes(&resp);
        match resp.bytes().await {
            Ok(body) => Reply {
                status,
                bytes_written: self.request_bytes,
                bytes_read: head + body.len() as u64,
                err: None,
            },
            Err(e) => Reply {
                status,
                bytes_written: self.request_bytes,
                bytes_read: head,
                err: Some(classify(&e, Phase::Read)),
            },
        }
    }
}

// ─── Request building helpers ────────────────────────────────────

fn build_headers(opt: &ClientOpt) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for raw in &opt.headers {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid header {raw:?}, expected K:V"))?;
        map.insert(
            HeaderName::from_bytes(name.trim().as_bytes())?,
            HeaderValue::from_str(value.trim())?,
        );
    }
    if let Some(host) = &opt.host {
        map.insert(reqwest::header::HOST, HeaderValue::from_str(host)?);
    }
    if let Some(ct) = &opt.content_type {
        map.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_str(ct)?);
    }
    Ok(map)
}

/// Estimated serialized size of the request line and headers. A pooled
/// client does not expose true wire counts, so the template size
/// stands in; it is identical for every attempt.
fn request_head_bytes(method: &Method, url: &Url, headers: &HeaderMap) -> u64 {
    let mut n = method.as_str().len() + url.path().len() + " HTTP/1.1\r\n".len();
    n += "Host: \r\n".len() + url.host_str().map(str::len).unwrap_or(0);
    for (name, value) in headers {
        n += name.as_str().len() + ": ".len() + value.len() + "\r\n".len();
    }
    n += "\r\n".len();
    n as u64
}

fn response_head_bytes(resp: &reqwest::Response) -> u64 {
    let mut n = "HTTP/1.1  \r\n".len() + 3 + resp.status().canonical_reason().map(str::len).unwrap_or(0);
    for (name, value) in resp.headers() {
        n += name.as_str().len() + ": ".len() + value.len() + "\r\n".len();
    }
    n += "\r\n".len();
    n as u64
}

// ─── Error classification ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Send,
    Read,
}

fn classify(e: &reqwest::Error, phase: Phase) -> ErrorKind {
    if e.is_connect() {
        if source_chain_mentions_dns(e) {
            ErrorKind::Dns
        } else {
            ErrorKind::Connect
        }
    } else if e.is_timeout() {
        match phase {
            Phase::Read => ErrorKind::Read,
            Phase::Send => ErrorKind::Timeout,
        }
    } else if e.is_decode() {
        ErrorKind::Proto
    } else if e.is_body() || e.is_request() {
        match phase {
            Phase::Send => ErrorKind::Write,
            Phase::Read => ErrorKind::Read,
        }
    } else {
        ErrorKind::Other
    }
}

/// The resolver error is buried in the source chain; its rendering is
/// the only portable way to tell dns failures from refused dials.
fn source_chain_mentions_dns(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = e.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if text.contains("dns") || text.contains("resolve") {
            return true;
        }
        source = inner.source();
    }
    false
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_tags_have_stable_names() {
        let tags = [
            (ErrorKind::Dns, "dns"),
            (ErrorKind::Connect, "connect"),
            (ErrorKind::Write, "write"),
            (ErrorKind::Read, "read"),
            (ErrorKind::Timeout, "timeout"),
            (ErrorKind::Cancelled, "cancelled"),
            (ErrorKind::Proto, "proto"),
            (ErrorKind::Other, "other"),
        ];
        for (kind, name) in tags {
            assert_eq!(kind.as_str(), name);
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("{name:?}"));
        }
    }

    #[test]
    fn headers_parse_from_colon_pairs() {
        let opt = ClientOpt {
            headers: vec!["X-Token: abc".into(), "Accept:application/json".into()],
            host: Some("example.com".into()),
            content_type: Some("text/plain".into()),
            ..Default::default()
        };
        let map = build_headers(&opt).unwrap();
        assert_eq!(map.get("x-token").unwrap(), "abc");
        assert_eq!(map.get("accept").unwrap(), "application/json");
        assert_eq!(map.get("host").unwrap(), "example.com");
        assert_eq!(map.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn malformed_header_is_rejected() {
        let opt = ClientOpt {
            headers: vec!["NoColonHere".into()],
            ..Default::default()
        };
        assert!(build_headers(&opt).is_err());
    }

    #[test]
    fn request_head_estimate_counts_all_parts() {
        let url = Url::parse("http://example.com/path").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-a", HeaderValue::from_static("1"));
        let n = request_head_bytes(&Method::GET, &url, &headers);
        // request line + host line + one header + terminating CRLF
        assert!(n > ("GET /path HTTP/1.1\r\n".len() + "Host: example.com\r\n".len()) as u64);
    }

    #[test]
    fn client_builds_from_minimal_options() {
        let opt = ClientOpt {
            url: "http://127.0.0.1:1/".into(),
            method: "POST".into(),
            body: BodySource::Bytes(b"hello".to_vec()),
            max_conns: 4,
            ..Default::default()
        };
        let client = HttpClient::new(&opt).unwrap();
        assert_eq!(client.method, Method::POST);
        assert!(client.request_bytes >= 5);
    }
}
