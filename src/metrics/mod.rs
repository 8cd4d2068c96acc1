pub mod histogram;
pub mod report;
pub mod series;

pub use report::{Snapshot, StreamReport};

use std::time::Duration;

use crate::client::ErrorKind;

/// The recorded result of one request attempt.
/// This is the "write" side — workers create these and push them through
/// the recorder channel to the aggregator.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Wall time from request dispatch to response body close
    pub latency: Duration,
    /// HTTP status code, zero when no response was obtained
    pub status: u16,
    /// Error tag; mutually exclusive with a received response
    pub err: Option<ErrorKind>,
    /// Octets pushed to the wire for the request
    pub bytes_written: u64,
    /// Octets pulled from the wire for the response
    pub bytes_read: u64,
}

impl RequestOutcome {
    /// Any received response counts as a success; only transport-level
    /// failures carry an error tag. 4xx/5xx land in the status tally.
    pub fn is_success(&self) -> bool {
        self.err.is_none()
    }
}
