//! Plain-text HTTP/1.1 exchange with a local `http://` endpoint.
//!
//! Header lines are written byte for byte in the order they arrived. A
//! `HeaderMap` based client lowercases names and groups repeated ones, which
//! breaks signature schemes that hash the raw header block.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::{Host, Url};

use super::forward::{Captured, FORWARDED_ATTEMPT_ID, FORWARDED_SOURCE, Failure, is_hop_by_hop};
use crate::attempt::{ErrorClass, HeaderList, InboundAttempt};
use crate::route::Route;

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_LINE_BYTES: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// A request ready to be written to a plain `http://` target.
pub(super) struct PlainRequest {
    url: Url,
    head: Vec<u8>,
    body: Bytes,
    /// `HEAD` responses carry framing headers but no body.
    bodyless_response: bool,
}

impl PlainRequest {
    pub(super) fn new(attempt: &InboundAttempt, route: &Route, url: Url) -> Result<Self, String> {
        let method = Method::from_bytes(attempt.method.as_bytes())
            .map_err(|_| format!("invalid method {:?}", attempt.method))?;
        let host = url.host_str().ok_or_else(|| format!("no host in {url}"))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut head = Vec::with_capacity(512);
        head.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
        push_header(&mut head, "Host", &authority);
        for (name, value) in &attempt.headers {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case(FORWARDED_SOURCE)
                || name.eq_ignore_ascii_case(FORWARDED_ATTEMPT_ID)
            {
                continue;
            }
            if !is_valid_header(name, value) {
                debug!(attempt_id = %attempt.attempt_id, "Skipping unrepresentable header {}", name);
                continue;
            }
            push_header(&mut head, name, value);
        }
        for (name, value) in [
            (FORWARDED_SOURCE, route.source_name.as_str()),
            (FORWARDED_ATTEMPT_ID, attempt.attempt_id.as_str()),
        ] {
            if is_valid_header(name, value) {
                push_header(&mut head, name, value);
            }
        }
        if !attempt.body.is_empty() || matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            push_header(&mut head, "Content-Length", &attempt.body.len().to_string());
        }
        push_header(&mut head, "Connection", "close");
        head.extend_from_slice(b"\r\n");

        Ok(Self {
            url,
            head,
            body: attempt.body.clone(),
            bodyless_response: method == Method::HEAD,
        })
    }

    /// Write the request and read back the response, keeping at most
    /// `max_body` bytes of its body.
    pub(super) async fn send(self, max_body: usize) -> Result<Captured, Failure> {
        let (host, port) =
            dial_target(&self.url).ok_or_else(|| (ErrorClass::Connect, format!("no address in {}", self.url)))?;
        let mut stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| (ErrorClass::Connect, e.to_string()))?;
        stream.write_all(&self.head).await.map_err(sending)?;
        if !self.body.is_empty() {
            stream.write_all(&self.body).await.map_err(sending)?;
        }
        stream.flush().await.map_err(sending)?;

        let mut conn = Conn {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        };
        let head = conn.read_head().await?;
        let mut body = BodyBuf::new(max_body);
        match Framing::of(&head, self.bodyless_response)? {
            Framing::Empty => {}
            Framing::Length(len) => conn.copy(len, &mut body).await?,
            Framing::Chunked => conn.copy_chunked(&mut body).await?,
            Framing::UntilClose => conn.copy_to_end(&mut body).await?,
        }

        Ok(Captured {
            status: head.status,
            headers: head
                .headers
                .into_iter()
                .filter(|(name, _)| !is_hop_by_hop(name))
                .collect(),
            body: body.bytes.freeze(),
            truncated: body.truncated,
        })
    }
}

fn is_valid_header(name: &str, value: &str) -> bool {
    HeaderName::from_bytes(name.as_bytes()).is_ok() && HeaderValue::from_bytes(value.as_bytes()).is_ok()
}

fn push_header(head: &mut Vec<u8>, name: &str, value: &str) {
    head.extend_from_slice(name.as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
}

fn dial_target(url: &Url) -> Option<(String, u16)> {
    let host = match url.host()? {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    Some((host, url.port_or_known_default()?))
}

fn sending(e: io::Error) -> Failure {
    (ErrorClass::Connect, format!("failed to send request: {e}"))
}

struct ResponseHead {
    status: u16,
    headers: HeaderList,
    len: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<ResponseHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(len) => Ok(Some(ResponseHead {
            status: response.code.unwrap_or_default(),
            headers: response
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
            len,
        })),
    }
}

enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

impl Framing {
    fn of(head: &ResponseHead, bodyless_response: bool) -> Result<Self, Failure> {
        if bodyless_response || matches!(head.status, 100..=199 | 204 | 304) {
            return Ok(Framing::Empty);
        }
        let chunked = head
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("transfer-encoding"))
            .next_back()
            .and_then(|(_, value)| value.rsplit(',').next())
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Framing::Chunked);
        }
        match head.headers.iter().find(|(name, _)| name.eq_ignore_ascii_case("content-length")) {
            Some((_, value)) => value
                .trim()
                .parse()
                .map(Framing::Length)
                .map_err(|_| (ErrorClass::LocalNonhttp, format!("invalid content-length {value:?}"))),
            None => Ok(Framing::UntilClose),
        }
    }
}

/// Response body capped at the truncation limit.
struct BodyBuf {
    bytes: BytesMut,
    max: usize,
    truncated: bool,
}

impl BodyBuf {
    fn new(max: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            max,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let room = self.max - self.bytes.len();
        if data.len() > room {
            self.bytes.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(data);
        }
    }
}

struct Conn {
    stream: TcpStream,
    buf: BytesMut,
}

impl Conn {
    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.stream.read_buf(&mut self.buf).await
    }

    async fn fill_body(&mut self) -> Result<usize, Failure> {
        self.fill().await.map_err(|e| (ErrorClass::Read, e.to_string()))
    }

    /// Final response head. Interim `1xx` responses are skipped.
    async fn read_head(&mut self) -> Result<ResponseHead, Failure> {
        loop {
            match parse_head(&self.buf) {
                Ok(Some(head)) => {
                    self.buf.advance(head.len);
                    if (100..200).contains(&head.status) && head.status != 101 {
                        continue;
                    }
                    return Ok(head);
                }
                Ok(None) => {}
                Err(e) => return Err((ErrorClass::LocalNonhttp, format!("malformed response: {e}"))),
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err((ErrorClass::LocalNonhttp, "response head too large".into()));
            }
            match self.fill().await {
                Ok(0) if self.buf.is_empty() => {
                    return Err((ErrorClass::LocalNonhttp, "connection closed without a response".into()));
                }
                Ok(0) => return Err((ErrorClass::LocalNonhttp, "connection closed mid-response".into())),
                Ok(_) => {}
                Err(e) => return Err((ErrorClass::LocalNonhttp, format!("failed to read response: {e}"))),
            }
        }
    }

    /// Move `len` body bytes into `body`, stopping early once it is full.
    async fn copy(&mut self, mut len: usize, body: &mut BodyBuf) -> Result<(), Failure> {
        while len > 0 && !body.truncated {
            if self.buf.is_empty() && self.fill_body().await? == 0 {
                return Err((
                    ErrorClass::Read,
                    format!("connection closed with {len} body bytes outstanding"),
                ));
            }
            let n = len.min(self.buf.len());
            body.push(&self.buf[..n]);
            self.buf.advance(n);
            len -= n;
        }
        Ok(())
    }

    async fn copy_to_end(&mut self, body: &mut BodyBuf) -> Result<(), Failure> {
        loop {
            body.push(&self.buf);
            self.buf.clear();
            if body.truncated || self.fill_body().await? == 0 {
                return Ok(());
            }
        }
    }

    async fn copy_chunked(&mut self, body: &mut BodyBuf) -> Result<(), Failure> {
        loop {
            let line = self.line().await?;
            let size = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size, 16)
                .map_err(|_| (ErrorClass::Read, format!("invalid chunk size {size:?}")))?;
            if size == 0 {
                return Ok(());
            }
            self.copy(size, body).await?;
            if body.truncated {
                return Ok(());
            }
            if !self.line().await?.is_empty() {
                return Err((ErrorClass::Read, "missing chunk terminator".into()));
            }
        }
    }

    async fn line(&mut self) -> Result<String, Failure> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                self.buf.advance(pos + 2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err((ErrorClass::Read, "chunk header too long".into()));
            }
            if self.fill_body().await? == 0 {
                return Err((ErrorClass::Read, "connection closed mid-body".into()));
            }
        }
    }
}
