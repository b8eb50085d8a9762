#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::Map;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use url::Url;

use hookrelay::event::EventBus;
use hookrelay::pipeline::{Forwarder, Pipeline, PipelineConfig, PipelineReport, inbound_channel};
use hookrelay::route::{ConnectionBinding, RouteTable};
use hookrelay::transport::message::{AttemptFrame, AttemptResultFrame, Frame, Heartbeat, Hello, Welcome};
use hookrelay::transport::{Endpoint, Transport, TransportConfig, TransportError, outbound_channel};

pub const SESSION_ID: &str = "ses_test";
pub const TOKEN: &str = "tok_test";
pub const CONNECTION_ID: &str = "web_orders";

/// Request as seen by the local server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Reply {
    pub status: u16,
    pub body: Bytes,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: &'static str) -> Self {
        Self {
            status: 200,
            body: Bytes::from_static(body.as_bytes()),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub struct LocalServer {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<Recorded>,
}

impl LocalServer {
    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).unwrap()
    }
}

/// In-process HTTP server standing in for the developer's app.
pub async fn local_server<F>(reply: F) -> LocalServer
where
    F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    let reply = reply.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                        let recorded = Recorded {
                            method: parts.method.to_string(),
                            uri: parts.uri.to_string(),
                            headers: parts
                                .headers
                                .iter()
                                .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or_default().to_string()))
                                .collect(),
                            body,
                        };
                        let reply = reply(&recorded);
                        let _ = tx.send(recorded);
                        if !reply.delay.is_zero() {
                            tokio::time::sleep(reply.delay).await;
                        }
                        let response = Response::builder()
                            .status(reply.status)
                            .body(Full::new(reply.body))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    LocalServer { addr, requests: rx }
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// One accepted websocket on the fake dispatcher.
pub struct DispatcherConn {
    ws: WebSocketStream<TcpStream>,
    pub headers: Vec<(String, String)>,
}

impl DispatcherConn {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub async fn send(&mut self, frame: &Frame) {
        let text = frame.encode().unwrap();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Next frame from the client, or `None` once it closes.
    pub async fn recv_raw(&mut self) -> Option<Frame> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Frame::decode(text.as_str()).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Like [`Self::recv_raw`] but answers client pings along the way.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.recv_raw().await? {
                Frame::Ping(beat) => self.send(&Frame::Pong(beat)).await,
                frame => return Some(frame),
            }
        }
    }

    pub async fn expect_hello(&mut self) -> Hello {
        match self.recv().await {
            Some(Frame::Hello(hello)) => hello,
            other => panic!("expected hello, got {other:?}"),
        }
    }

    pub async fn welcome(&mut self, heartbeat_ms: Option<u64>) {
        self.send(&Frame::Welcome(Welcome {
            session_id: SESSION_ID.into(),
            heartbeat_interval_ms: heartbeat_ms,
            notice: None,
            session_valid: true,
            extra: Map::new(),
        }))
        .await;
    }

    /// Hello, then welcome.
    pub async fn accept_session(&mut self) -> Hello {
        let hello = self.expect_hello().await;
        self.welcome(None).await;
        hello
    }

    pub async fn expect_result(&mut self) -> AttemptResultFrame {
        loop {
            match self.recv().await {
                Some(Frame::AttemptResult(result)) => return result,
                Some(Frame::Pong(_)) => {}
                other => panic!("expected attempt_result, got {other:?}"),
            }
        }
    }

    pub async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: code.into(),
            reason: "test".to_string().into(),
        };
        let _ = self.ws.send(Message::Close(Some(frame))).await;
    }

    pub async fn ping(&mut self, token: u64) {
        self.send(&Frame::Ping(Heartbeat { token })).await;
    }
}

pub struct FakeDispatcher {
    pub url: String,
    conns: mpsc::UnboundedReceiver<DispatcherConn>,
}

impl FakeDispatcher {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/socket", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let captured = Arc::new(Mutex::new(Vec::new()));
                let sink = captured.clone();
                let callback = move |req: &WsRequest, resp: WsResponse| {
                    let headers = req
                        .headers()
                        .iter()
                        .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or_default().to_string()))
                        .collect();
                    *sink.lock().unwrap() = headers;
                    Ok::<_, ErrorResponse>(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let headers = captured.lock().unwrap().clone();
                if tx.send(DispatcherConn { ws, headers }).is_err() {
                    break;
                }
            }
        });

        Self { url, conns: rx }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            session_id: SESSION_ID.into(),
            token: TOKEN.into(),
            url: self.url.clone(),
        }
    }

    pub async fn accept(&mut self) -> DispatcherConn {
        timeout(Duration::from_secs(5), self.conns.recv())
            .await
            .expect("client did not connect in time")
            .expect("dispatcher stopped")
    }
}

pub fn attempt_frame(id: &str, path: &str, body: &'static [u8]) -> AttemptFrame {
    AttemptFrame {
        attempt_id: id.into(),
        connection_id: CONNECTION_ID.into(),
        method: "POST".into(),
        path: path.into(),
        query: None,
        headers: vec![("Content-Type".into(), "application/json".into())],
        body: Bytes::from_static(body),
        requested_at: Utc::now(),
        ordinal: 1,
        event_id: Some(format!("evt_{id}")),
        more_chunks: false,
        extra: Map::new(),
    }
}

pub fn routes_to(local: &Url) -> Arc<RouteTable> {
    let binding = ConnectionBinding {
        connection_id: CONNECTION_ID.into(),
        connection_name: "orders-cli".into(),
        source_id: "src_orders".into(),
        source_name: "orders".into(),
        source_url: Some("https://in.hookrelay.dev/src_orders".into()),
    };
    Arc::new(RouteTable::build(&[binding], local))
}

/// Transport and pipeline wired together the way the CLI runs them.
pub struct Harness {
    pub bus: EventBus,
    pub cancel: CancellationToken,
    pub routes: watch::Sender<Arc<RouteTable>>,
    pub transport: JoinHandle<(Result<(), TransportError>, Vec<Frame>)>,
    pub pipeline: JoinHandle<PipelineReport>,
}

impl Harness {
    pub fn start(
        endpoint: Endpoint,
        routes: Arc<RouteTable>,
        pipeline_config: PipelineConfig,
        transport_config: TransportConfig,
    ) -> Self {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let (routes_tx, routes_rx) = watch::channel(routes);
        let (in_flight_tx, in_flight_rx) = watch::channel(0);
        let (inbound_tx, inbound_rx) = inbound_channel(&pipeline_config);
        let (sink, outbound_rx) = outbound_channel(64, Duration::from_secs(2));

        let forwarder = Forwarder::new(pipeline_config.request_timeout, pipeline_config.max_body_bytes).unwrap();
        let pipeline = Pipeline::new(pipeline_config, forwarder, routes_rx, sink, bus.clone(), in_flight_tx);
        let pipeline = tokio::spawn(pipeline.run(inbound_rx, cancel.clone()));

        let mut transport = Transport::new(transport_config, bus.clone(), inbound_tx, outbound_rx, in_flight_rx);
        let transport_cancel = cancel.clone();
        let transport = tokio::spawn(async move {
            let result = transport.run(&endpoint, &transport_cancel).await;
            (result, transport.drain_unsent())
        });

        Self {
            bus,
            cancel,
            routes: routes_tx,
            transport,
            pipeline,
        }
    }
}
