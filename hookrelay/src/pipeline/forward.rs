//! Replays one attempt against the local endpoint.
//!
//! Plain `http://` targets get a hand-written HTTP/1.1 request so header
//! order and case survive the trip. `https://` targets go through `reqwest`.

use std::time::Duration;

use bytes::BytesMut;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::Method;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attempt::{AttemptResult, ErrorClass, HeaderList, InboundAttempt, SHUTDOWN_REASON};
use crate::route::Route;

use super::wire::PlainRequest;

/// Headers that describe a single hop and are never replayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub const FORWARDED_SOURCE: &str = "x-forwarded-source";
pub const FORWARDED_ATTEMPT_ID: &str = "x-forwarded-attempt-id";

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("proxy-") || HOP_BY_HOP.contains(&lower.as_str())
}

/// Response captured from the local endpoint.
#[derive(Debug)]
pub(super) struct Captured {
    pub(super) status: u16,
    pub(super) headers: HeaderList,
    pub(super) body: bytes::Bytes,
    pub(super) truncated: bool,
}

pub(super) type Failure = (ErrorClass, String);

enum Dispatch {
    Plain(PlainRequest),
    Client(reqwest::Request),
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
    max_body: usize,
}

impl Forwarder {
    pub fn new(timeout: Duration, max_body: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            // Report the bytes exactly as the local server produced them
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .no_zstd()
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            client,
            timeout,
            max_body,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the `reqwest` request for `attempt`, used for `https://` targets.
    ///
    /// The body is passed through untouched. `Content-Length` is dropped along
    /// with the hop-by-hop headers because the client derives it from the body.
    pub fn build_request(&self, attempt: &InboundAttempt, route: &Route) -> Result<reqwest::Request, String> {
        let method = Method::from_bytes(attempt.method.as_bytes())
            .map_err(|_| format!("invalid method {:?}", attempt.method))?;
        let url = route.target_url(&attempt.path, attempt.query.as_deref());

        let mut headers = HeaderMap::with_capacity(attempt.headers.len() + 2);
        for (name, value) in &attempt.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(attempt_id = %attempt.attempt_id, "Skipping unrepresentable header {}", name),
            }
        }
        if let Ok(value) = HeaderValue::from_str(&route.source_name) {
            headers.insert(FORWARDED_SOURCE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&attempt.attempt_id) {
            headers.insert(FORWARDED_ATTEMPT_ID, value);
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if !attempt.body.is_empty() {
            builder = builder.body(attempt.body.clone());
        }
        builder.build().map_err(|e| e.to_string())
    }

    /// Replay `attempt` and capture the outcome. Never fails: every error is
    /// classified into the result.
    ///
    /// `cancel` cuts the attempt short with a `timeout`/`shutdown` result.
    pub async fn forward(&self, attempt: &InboundAttempt, route: &Route, cancel: &CancellationToken) -> AttemptResult {
        let started = Instant::now();
        let url = route.target_url(&attempt.path, attempt.query.as_deref());
        let prepared = if url.scheme() == "http" {
            PlainRequest::new(attempt, route, url).map(Dispatch::Plain)
        } else {
            self.build_request(attempt, route).map(Dispatch::Client)
        };
        let dispatch = match prepared {
            Ok(dispatch) => dispatch,
            Err(reason) => {
                return AttemptResult::failed(attempt, ErrorClass::LocalNonhttp, reason, started.elapsed());
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err((ErrorClass::Timeout, SHUTDOWN_REASON.to_string())),
            outcome = timeout(self.timeout, self.dispatch(dispatch)) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err((
                    ErrorClass::Timeout,
                    format!("no response within {}s", self.timeout.as_secs_f64()),
                )),
            },
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(captured) => AttemptResult {
                attempt_id: attempt.attempt_id.clone(),
                connection_id: attempt.connection_id.clone(),
                status: Some(captured.status),
                headers: captured.headers,
                body: captured.body,
                truncated: captured.truncated,
                error: None,
                reason: None,
                elapsed,
                finished_at: chrono::Utc::now(),
            },
            Err((class, reason)) => AttemptResult::failed(attempt, class, reason, elapsed),
        }
    }

    async fn dispatch(&self, dispatch: Dispatch) -> Result<Captured, Failure> {
        match dispatch {
            Dispatch::Plain(request) => request.send(self.max_body).await,
            Dispatch::Client(request) => self.execute(request).await,
        }
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Captured, Failure> {
        let mut response = self.client.execute(request).await.map_err(classify)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut body = BytesMut::new();
        let mut truncated = false;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.max_body - body.len();
                    if chunk.len() > room {
                        body.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return Err((ErrorClass::Read, e.to_string())),
            }
        }

        Ok(Captured {
            status,
            headers,
            body: body.freeze(),
            truncated,
        })
    }
}

fn classify(e: reqwest::Error) -> Failure {
    let class = if e.is_timeout() {
        ErrorClass::Timeout
    } else if e.is_connect() {
        ErrorClass::Connect
    } else {
        ErrorClass::LocalNonhttp
    };
    (class, error_chain(&e))
}

/// `reqwest` errors carry the useful part in their sources.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
