//! Delivery attempts and their outcomes.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered, case-preserving list of header `(name, value)` pairs.
pub type HeaderList = Vec<(String, String)>;

/// A single webhook delivery the dispatcher wants replayed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAttempt {
    pub attempt_id: String,
    pub connection_id: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderList,
    pub body: Bytes,
    pub requested_at: DateTime<Utc>,
    pub ordinal: u32,
    pub event_id: Option<String>,
}

impl InboundAttempt {
    /// Path plus query, as received.
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// Why a replay did not produce an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// TCP/TLS failure reaching the local target.
    Connect,
    /// The per-attempt deadline elapsed, or the attempt was cut off by shutdown.
    Timeout,
    /// The response body failed mid-stream.
    Read,
    /// The local side answered with something that is not HTTP, or the
    /// attempt could not be turned into a request at all.
    LocalNonhttp,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::Connect => "connect",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Read => "read",
            ErrorClass::LocalNonhttp => "local-nonhttp",
        })
    }
}

/// Coarse grouping of an outcome used for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    Informational,
    Success,
    Redirect,
    ClientError,
    ServerError,
    Failed,
}

impl StatusBucket {
    pub fn label(&self) -> &'static str {
        match self {
            StatusBucket::Informational => "1xx",
            StatusBucket::Success => "2xx",
            StatusBucket::Redirect => "3xx",
            StatusBucket::ClientError => "4xx",
            StatusBucket::ServerError => "5xx",
            StatusBucket::Failed => "err",
        }
    }
}

/// Outcome of replaying one [`InboundAttempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub attempt_id: String,
    pub connection_id: String,
    pub status: Option<u16>,
    pub headers: HeaderList,
    pub body: Bytes,
    pub truncated: bool,
    pub error: Option<ErrorClass>,
    pub reason: Option<String>,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Reason attached to attempts cut off by a shutdown.
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Reason attached to attempts whose connection id has no route.
pub const UNKNOWN_ROUTE_REASON: &str = "unknown route";

impl AttemptResult {
    /// A result for an attempt that never produced an HTTP response.
    pub fn failed(
        attempt: &InboundAttempt,
        class: ErrorClass,
        reason: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            attempt_id: attempt.attempt_id.clone(),
            connection_id: attempt.connection_id.clone(),
            status: None,
            headers: Vec::new(),
            body: Bytes::new(),
            truncated: false,
            error: Some(class),
            reason: Some(reason.into()),
            elapsed,
            finished_at: Utc::now(),
        }
    }

    pub fn is_shutdown_timeout(&self) -> bool {
        self.error == Some(ErrorClass::Timeout) && self.reason.as_deref() == Some(SHUTDOWN_REASON)
    }

    pub fn bucket(&self) -> StatusBucket {
        match (self.error, self.status) {
            (Some(_), _) | (None, None) => StatusBucket::Failed,
            (None, Some(status)) => match status {
                100..=199 => StatusBucket::Informational,
                200..=299 => StatusBucket::Success,
                300..=399 => StatusBucket::Redirect,
                400..=499 => StatusBucket::ClientError,
                _ => StatusBucket::ServerError,
            },
        }
    }

    /// First value of a response header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
