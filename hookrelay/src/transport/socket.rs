//! Thin wrapper around `tokio-tungstenite` giving the transport typed
//! reader/writer halves that speak [`Frame`]s.

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::TransportError;
use super::message::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the reader hands back after skipping transport-level noise.
#[derive(Debug)]
pub enum Incoming {
    Frame(Frame),
    /// A text message that did not decode.
    Malformed(String),
    /// Websocket-level ping; the caller answers with [`SocketWriter::send_pong`].
    Ping(Bytes),
    Close { code: u16, reason: String },
}

pub struct SocketWriter {
    sink: SplitSink<WsStream, WsMessage>,
}

impl SocketWriter {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame.encode()?;
        self.sink.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        self.sink.send(WsMessage::Close(Some(frame))).await?;
        self.sink.close().await?;
        Ok(())
    }

    pub async fn send_pong(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.sink.send(WsMessage::Pong(data)).await?;
        Ok(())
    }
}

pub struct SocketReader {
    stream: SplitStream<WsStream>,
}

impl SocketReader {
    /// Next protocol-level message. `None` once the stream ends.
    ///
    /// Binary messages are not part of the protocol and are dropped.
    pub async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => {
                    return Some(Ok(match Frame::decode(text.as_str()) {
                        Ok(frame) => Incoming::Frame(frame),
                        Err(_) => Incoming::Malformed(text.to_string()),
                    }));
                }
                Ok(WsMessage::Ping(data)) => return Some(Ok(Incoming::Ping(data))),
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (f.code.into(), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(Incoming::Close { code, reason }));
                }
                Ok(WsMessage::Binary(data)) => {
                    tracing::debug!("Ignoring {} byte binary message", data.len());
                }
                Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Dial `url` with the given extra headers and split the socket.
pub async fn connect(
    url: &str,
    headers: &[(&str, &str)],
) -> Result<(SocketWriter, SocketReader), TransportError> {
    let mut request = url.into_client_request()?;
    for &(name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Handshake(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Handshake(format!("invalid header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    let (sink, stream) = stream.split();
    Ok((SocketWriter { sink }, SocketReader { stream }))
}

/// Convert an HTTP(S) URL to the WS(S) scheme; `ws`/`wss` pass through.
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::Socket(Box::new(e))
    }
}
