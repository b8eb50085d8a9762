//! The single long-lived websocket to the dispatcher.
//!
//! [`Transport`] owns the socket: it is the only writer, it reassembles
//! inbound attempts and feeds them to the pipeline in arrival order, and it
//! drains the bounded outbound queue that everything else writes into
//! through an [`OutboundSink`].
//!
//! ```text
//! Connecting ──welcome──► Open ──cancel / control(drain)──► Draining ──► Closed
//!     ▲                     │                                              │
//!     └──── backoff ◄───────┴── ping timeout / socket error ◄──────────────┘
//! ```

mod backoff;
pub mod message;
mod reassembly;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::mpsc::{OwnedPermit, error::SendError as ChannelClosed};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::{Backoff, BackoffPolicy};
pub use reassembly::{Reassembler, ReassemblyError};

use crate::attempt::{AttemptResult, ErrorClass, InboundAttempt, SHUTDOWN_REASON};
use crate::event::{Delivery, Event, EventBus, Phase};
use message::{Bye, CAPABILITIES, CLOSE_REAUTH_REQUIRED, ControlKind, Frame, Hello, MessageError};
use socket::{Incoming, SocketReader, SocketWriter};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Socket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("session rejected by the dispatcher, reauthentication required")]
    ReauthRequired,
}

/// Why a frame could not be queued. The frame is handed back.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Overloaded(Frame),
    #[error("transport has shut down")]
    Closed(Frame),
}

impl SendError {
    pub fn into_frame(self) -> Frame {
        match self {
            SendError::Overloaded(frame) | SendError::Closed(frame) => frame,
        }
    }
}

/// Producer side of the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<Frame>,
    send_timeout: Duration,
}

impl OutboundSink {
    /// Queue a frame, waiting at most the configured timeout for room.
    pub async fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.tx
            .send_timeout(frame, self.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(frame) => SendError::Overloaded(frame),
                SendTimeoutError::Closed(frame) => SendError::Closed(frame),
            })
    }
}

pub fn outbound_channel(
    capacity: usize,
    send_timeout: Duration,
) -> (OutboundSink, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundSink { tx, send_timeout }, rx)
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub session_id: String,
    pub token: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub client_version: String,
    /// Used when the welcome does not negotiate an interval.
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub drain_deadline: Duration,
    /// Extra time on a local drain for results finalized at the deadline.
    pub flush_grace: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            drain_deadline: Duration::from_secs(10),
            flush_grace: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainKind {
    /// We are shutting down.
    Local,
    /// The dispatcher asked us to move off this socket.
    Server,
}

#[derive(Debug, Clone, Copy)]
struct Drain {
    kind: DrainKind,
    deadline: Instant,
}

#[derive(Debug)]
enum Ended {
    Shutdown,
    ServerDrain,
    Reauth,
    Lost(String),
}

struct Connection {
    writer: SocketWriter,
    reader: SocketReader,
    heartbeat: Duration,
}

/// Per-socket bookkeeping inside [`Transport::serve`].
#[derive(Default)]
struct ConnState {
    ping_token: u64,
    outstanding_pings: u32,
    /// Attempt read off the socket that the pipeline has no room for yet.
    stalled: Option<InboundAttempt>,
    drain: Option<Drain>,
}

enum Flow {
    Continue,
    End(Ended),
}

pub struct Transport {
    config: TransportConfig,
    bus: EventBus,
    /// Released on shutdown so the pipeline sees the end of its queue.
    inbound: Option<mpsc::Sender<InboundAttempt>>,
    outbound: mpsc::Receiver<Frame>,
    outbound_closed: bool,
    in_flight: watch::Receiver<usize>,
    backoff: Backoff,
    reassembler: Reassembler,
    /// Frame whose write failed; written first on the next socket.
    carry: Option<Frame>,
    welcomes: u64,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        bus: EventBus,
        inbound: mpsc::Sender<InboundAttempt>,
        outbound: mpsc::Receiver<Frame>,
        in_flight: watch::Receiver<usize>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            config,
            bus,
            inbound: Some(inbound),
            outbound,
            outbound_closed: false,
            in_flight,
            backoff,
            reassembler: Reassembler::new(),
            carry: None,
            welcomes: 0,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Number of welcomes received over the transport's lifetime.
    pub fn welcomes(&self) -> u64 {
        self.welcomes
    }

    /// Keep a socket to `endpoint` alive until `cancel` fires.
    ///
    /// Returns `Ok(())` after a local drain, or
    /// [`TransportError::ReauthRequired`] when the dispatcher rejects the
    /// session. Every other failure is retried with backoff.
    pub async fn run(
        &mut self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        loop {
            if cancel.is_cancelled() {
                self.release_inbound();
                self.bus.update_state(|s| {
                    s.phase = Phase::Closed;
                    s.reconnect_in = None;
                });
                return Ok(());
            }

            let failures = self.backoff.failures();
            self.bus.update_state(|s| {
                s.phase = Phase::Connecting;
                s.reconnect_in = None;
                s.failures = failures;
                s.reauthenticating = false;
            });
            info!("Connecting to {}...", endpoint.url);

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => continue,
                result = self.handshake(endpoint) => result,
            };

            match connected {
                Ok(mut conn) => {
                    self.welcomes += 1;
                    self.backoff.on_open(Instant::now());
                    let ended = self.serve(&mut conn, cancel).await;
                    self.backoff.on_close(Instant::now());
                    self.reassembler.clear();
                    match ended {
                        Ended::Shutdown => {
                            info!("Dispatcher connection closed");
                            self.release_inbound();
                            self.bus.update_state(|s| s.phase = Phase::Closed);
                            return Ok(());
                        }
                        Ended::Reauth => return Err(self.reauth_required()),
                        Ended::ServerDrain => info!("Dispatcher drained the connection"),
                        Ended::Lost(reason) => warn!("Dispatcher connection lost: {}", reason),
                    }
                }
                Err(TransportError::ReauthRequired) => return Err(self.reauth_required()),
                Err(e) => warn!("Failed to connect to dispatcher: {}", e),
            }

            let delay = self.backoff.next_delay();
            let failures = self.backoff.failures();
            if self.backoff.at_ceiling() {
                self.bus.notice(format!(
                    "Dispatcher unreachable after {failures} attempts, still retrying"
                ));
            }
            self.bus.update_state(|s| {
                s.phase = Phase::Closed;
                s.reconnect_in = Some(delay);
                s.failures = failures;
            });
            info!("Reconnecting in {} ms...", delay.as_millis());

            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Frames still queued (or carried over from a failed write) once the
    /// transport has stopped for good.
    pub fn drain_unsent(&mut self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self.carry.take().into_iter().collect();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Stop handing attempts to the pipeline. Once released, the pipeline
    /// settles what is left in its queue and returns.
    pub fn release_inbound(&mut self) {
        self.inbound = None;
    }

    fn reauth_required(&self) -> TransportError {
        warn!("Dispatcher rejected the session");
        self.bus.update_state(|s| {
            s.phase = Phase::Closed;
            s.reconnect_in = None;
            s.reauthenticating = true;
        });
        TransportError::ReauthRequired
    }

    async fn handshake(&mut self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        let handshake_timeout = self.config.handshake_timeout;
        let authorization = format!("Bearer {}", endpoint.token);
        let headers = [
            ("Authorization", authorization.as_str()),
            ("X-Session-Id", endpoint.session_id.as_str()),
        ];
        let (mut writer, mut reader) = timeout(handshake_timeout, socket::connect(&endpoint.url, &headers))
            .await
            .map_err(|_| TransportError::Handshake("timed out dialing".into()))??;

        writer
            .send_frame(&Frame::Hello(Hello {
                session_id: endpoint.session_id.clone(),
                token: endpoint.token.clone(),
                client_version: self.config.client_version.clone(),
                capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            }))
            .await?;

        let welcome = timeout(handshake_timeout, async {
            loop {
                match reader.recv().await {
                    None => {
                        return Err(TransportError::Handshake(
                            "socket closed before welcome".into(),
                        ));
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Incoming::Frame(Frame::Welcome(welcome)))) => return Ok(welcome),
                    Some(Ok(Incoming::Frame(Frame::Ping(beat)))) => {
                        writer.send_frame(&Frame::Pong(beat)).await?;
                    }
                    Some(Ok(Incoming::Ping(data))) => writer.send_pong(data).await?,
                    Some(Ok(Incoming::Frame(Frame::Control(control))))
                        if control.kind == ControlKind::SessionRevoked =>
                    {
                        return Err(TransportError::ReauthRequired);
                    }
                    Some(Ok(Incoming::Frame(Frame::Bye(bye)))) => {
                        return Err(TransportError::Handshake(format!(
                            "dispatcher said bye: {}",
                            bye.reason.unwrap_or_default()
                        )));
                    }
                    Some(Ok(Incoming::Close { code, reason })) => {
                        return Err(if code == CLOSE_REAUTH_REQUIRED {
                            TransportError::ReauthRequired
                        } else {
                            TransportError::Handshake(format!("closed with {code}: {reason}"))
                        });
                    }
                    Some(Ok(other)) => debug!("Ignoring {:?} before welcome", other),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Handshake("timed out waiting for welcome".into()))??;

        if !welcome.session_valid {
            return Err(TransportError::ReauthRequired);
        }
        if welcome.session_id != endpoint.session_id {
            warn!(
                "Dispatcher assigned session {} instead of {}",
                welcome.session_id, endpoint.session_id
            );
            return Err(TransportError::ReauthRequired);
        }
        if let Some(notice) = welcome.notice {
            self.bus.notice(notice);
        }

        let heartbeat = welcome
            .heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.config.heartbeat_interval);
        info!("Connected to dispatcher (heartbeat every {:?})", heartbeat);

        Ok(Connection {
            writer,
            reader,
            heartbeat,
        })
    }

    async fn serve(&mut self, conn: &mut Connection, cancel: &CancellationToken) -> Ended {
        let Connection {
            writer,
            reader,
            heartbeat,
        } = conn;
        self.bus.update_state(|s| {
            s.phase = Phase::Open;
            s.reconnect_in = None;
        });

        if let Some(frame) = self.carry.take() {
            if let Err(e) = writer.send_frame(&frame).await {
                self.carry = Some(frame);
                return Ended::Lost(format!("write failed: {e}"));
            }
        }

        let period = *heartbeat;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = self.in_flight.clone();
        let mut in_flight_live = true;
        let mut inbound = self.inbound.clone();
        let mut st = ConnState::default();

        loop {
            if let Some(drain) = st.drain {
                if self.drained(drain.kind, &in_flight) {
                    return self.close(writer, drain.kind, "drained").await;
                }
            }
            let deadline = st.drain.map(|d| d.deadline);
            let local_drain = matches!(st.drain, Some(Drain { kind: DrainKind::Local, .. }));
            let server_drain = matches!(st.drain, Some(Drain { kind: DrainKind::Server, .. }));

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !local_drain => {
                    info!("Draining dispatcher connection");
                    // A stalled attempt is still handed over; the pipeline settles it.
                    if st.stalled.is_none() {
                        inbound = None;
                        self.release_inbound();
                    }
                    st.drain = Some(Drain {
                        kind: DrainKind::Local,
                        deadline: Instant::now() + self.config.drain_deadline + self.config.flush_grace,
                    });
                    self.bus.update_state(|s| s.phase = Phase::Draining);
                }

                permit = reserve(inbound.clone()), if st.stalled.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(attempt) = st.stalled.take() {
                                permit.send(attempt);
                            }
                            if local_drain {
                                inbound = None;
                                self.release_inbound();
                            } else {
                                debug!("Pipeline has room again, resuming socket reads");
                            }
                        }
                        Err(_) => {
                            if let Some(attempt) = st.stalled.take() {
                                if let Err(ended) = self.cut_off(attempt, writer).await {
                                    return ended;
                                }
                            }
                        }
                    }
                }

                out = self.outbound.recv(), if !self.outbound_closed => match out {
                    Some(frame) => {
                        if let Err(e) = writer.send_frame(&frame).await {
                            self.carry = Some(frame);
                            return Ended::Lost(format!("write failed: {e}"));
                        }
                    }
                    None => self.outbound_closed = true,
                },

                incoming = reader.recv(), if st.stalled.is_none() => {
                    let flow = match incoming {
                        None => Flow::End(Ended::Lost("socket closed".into())),
                        Some(Err(e)) => Flow::End(Ended::Lost(e.to_string())),
                        Some(Ok(Incoming::Ping(data))) => match writer.send_pong(data).await {
                            Ok(()) => Flow::Continue,
                            Err(e) => Flow::End(Ended::Lost(format!("write failed: {e}"))),
                        },
                        Some(Ok(Incoming::Malformed(text))) => {
                            warn!("Dropping malformed frame ({} bytes)", text.len());
                            Flow::Continue
                        }
                        Some(Ok(Incoming::Close { code, reason })) => Flow::End(if code == CLOSE_REAUTH_REQUIRED {
                            Ended::Reauth
                        } else if local_drain {
                            Ended::Shutdown
                        } else {
                            Ended::Lost(format!("closed by dispatcher ({code}) {reason}"))
                        }),
                        Some(Ok(Incoming::Frame(frame))) => self.on_frame(frame, writer, &mut st).await,
                    };
                    if let Flow::End(ended) = flow {
                        return ended;
                    }
                }

                _ = ticker.tick() => {
                    if st.stalled.is_some() {
                        // Pongs cannot be read while the socket is paused.
                        st.outstanding_pings = 0;
                    } else if st.outstanding_pings >= 2 {
                        return Ended::Lost("heartbeat timeout".into());
                    }
                    st.ping_token += 1;
                    st.outstanding_pings += 1;
                    if let Err(e) = writer.send_frame(&Frame::Ping(message::Heartbeat { token: st.ping_token })).await {
                        return Ended::Lost(format!("write failed: {e}"));
                    }
                    self.bus.update_state(|s| s.last_ping_sent = Some(Utc::now()));
                }

                changed = in_flight.changed(), if server_drain && in_flight_live => {
                    if changed.is_err() {
                        in_flight_live = false;
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if deadline.is_some() => {
                    let kind = st.drain.map_or(DrainKind::Local, |d| d.kind);
                    warn!("Drain deadline reached with work outstanding");
                    return self.close(writer, kind, "drain deadline").await;
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame, writer: &mut SocketWriter, st: &mut ConnState) -> Flow {
        let draining = st.drain.is_some();
        match frame {
            Frame::Ping(beat) => {
                if let Err(e) = writer.send_frame(&Frame::Pong(beat)).await {
                    return Flow::End(Ended::Lost(format!("write failed: {e}")));
                }
            }
            Frame::Pong(beat) => {
                if beat.token <= st.ping_token {
                    st.outstanding_pings = 0;
                    self.bus.update_state(|s| s.last_pong = Some(Utc::now()));
                } else {
                    debug!("Pong for unknown token {}", beat.token);
                }
            }
            Frame::Attempt(attempt) if draining => {
                debug!(attempt_id = %attempt.attempt_id, "Draining, leaving attempt to the dispatcher");
            }
            Frame::Attempt(attempt) => {
                if let Some(attempt) = self.reassembler.push_attempt(attempt) {
                    if let Some(orphan) = self.deliver(attempt, st) {
                        if let Err(ended) = self.cut_off(orphan, writer).await {
                            return Flow::End(ended);
                        }
                    }
                }
            }
            Frame::AttemptChunk(_) if draining => {}
            Frame::AttemptChunk(chunk) => match self.reassembler.push_chunk(chunk) {
                Ok(Some(attempt)) => {
                    if let Some(orphan) = self.deliver(attempt, st) {
                        if let Err(ended) = self.cut_off(orphan, writer).await {
                            return Flow::End(ended);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Discarding partial attempt: {}", e),
            },
            Frame::Control(control) => match control.kind {
                ControlKind::RateLimit => {
                    let message = control.message.unwrap_or_else(|| "rate limited".into());
                    warn!("Dispatcher warning: {}", message);
                    self.bus.notice(message);
                }
                ControlKind::SessionRevoked => return Flow::End(Ended::Reauth),
                ControlKind::Drain => {
                    if !draining {
                        info!("Dispatcher requested drain");
                        st.drain = Some(Drain {
                            kind: DrainKind::Server,
                            deadline: Instant::now() + self.config.drain_deadline,
                        });
                        self.bus.update_state(|s| s.phase = Phase::Draining);
                    }
                }
                ControlKind::Other => {
                    if let Some(message) = control.message {
                        self.bus.notice(message);
                    }
                }
            },
            Frame::Bye(Bye { reason }) => {
                info!("Dispatcher said bye: {}", reason.as_deref().unwrap_or("no reason"));
                return Flow::End(match st.drain {
                    Some(Drain { kind: DrainKind::Local, .. }) => Ended::Shutdown,
                    Some(Drain { kind: DrainKind::Server, .. }) => Ended::ServerDrain,
                    None => Ended::Lost("dispatcher closed the session".into()),
                });
            }
            other => debug!("Ignoring {} frame", other.name()),
        }
        Flow::Continue
    }

    /// Hand an attempt to the pipeline, pausing reads if it has no room.
    /// Returns the attempt when the pipeline is gone.
    fn deliver(&mut self, attempt: InboundAttempt, st: &mut ConnState) -> Option<InboundAttempt> {
        let Some(inbound) = &self.inbound else {
            return Some(attempt);
        };
        match inbound.try_send(attempt) {
            Ok(()) => None,
            Err(TrySendError::Full(attempt)) => {
                debug!("Pipeline queue full, pausing socket reads");
                st.stalled = Some(attempt);
                None
            }
            Err(TrySendError::Closed(attempt)) => Some(attempt),
        }
    }

    /// Answer for an attempt the pipeline can no longer take, straight on the socket.
    async fn cut_off(&mut self, attempt: InboundAttempt, writer: &mut SocketWriter) -> Result<(), Ended> {
        warn!(attempt_id = %attempt.attempt_id, "Pipeline stopped, reporting attempt as cut off");
        let result = AttemptResult::failed(&attempt, ErrorClass::Timeout, SHUTDOWN_REASON, Duration::ZERO);
        let frame = Frame::from(&result);
        self.bus.publish(Event::Delivery(Arc::new(Delivery::new(&attempt, None, result))));
        if let Err(e) = writer.send_frame(&frame).await {
            self.carry = Some(frame);
            return Err(Ended::Lost(format!("write failed: {e}")));
        }
        Ok(())
    }

    fn drained(&self, kind: DrainKind, in_flight: &watch::Receiver<usize>) -> bool {
        if self.carry.is_some() {
            return false;
        }
        match kind {
            DrainKind::Local => self.outbound_closed,
            DrainKind::Server => *in_flight.borrow() == 0 && self.outbound.is_empty(),
        }
    }

    async fn close(&mut self, writer: &mut SocketWriter, kind: DrainKind, reason: &str) -> Ended {
        let bye = Frame::Bye(Bye {
            reason: Some(reason.to_string()),
        });
        if let Err(e) = writer.send_frame(&bye).await {
            debug!("Failed to send bye: {}", e);
        }
        if let Err(e) = writer.close(1000, reason).await {
            debug!("Failed to close socket: {}", e);
        }
        match kind {
            DrainKind::Local => Ended::Shutdown,
            DrainKind::Server => Ended::ServerDrain,
        }
    }
}

async fn reserve(
    inbound: Option<mpsc::Sender<InboundAttempt>>,
) -> Result<OwnedPermit<InboundAttempt>, ChannelClosed<()>> {
    match inbound {
        Some(tx) => tx.reserve_owned().await,
        None => Err(ChannelClosed(())),
    }
}
