//! Event bus between the core and whoever watches it (the status UI, tests).
//!
//! Deliveries travel over a broadcast channel, so a slow subscriber loses
//! the oldest entries instead of stalling the pipeline. Transport state is
//! latest-wins over a watch channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use crate::attempt::{AttemptResult, InboundAttempt};
use crate::route::Route;

const EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// Condition of the dispatcher socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportState {
    pub phase: Phase,
    pub last_ping_sent: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    /// Reconnects since the socket was last stable.
    pub failures: u32,
    /// Delay until the next dial when waiting to reconnect.
    pub reconnect_in: Option<Duration>,
    /// The session was rejected and a new one is being negotiated.
    pub reauthenticating: bool,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            phase: Phase::Connecting,
            last_ping_sent: None,
            last_pong: None,
            failures: 0,
            reconnect_in: None,
            reauthenticating: false,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reauthenticating {
            return f.write_str("Session expired, re-authenticating");
        }
        match (self.phase, self.reconnect_in) {
            (Phase::Open, _) => f.write_str("Connected"),
            (Phase::Draining, _) => f.write_str("Draining"),
            (Phase::Closed, Some(delay)) => {
                write!(f, "Reconnecting in {}s…", delay.as_secs_f64().ceil() as u64)
            }
            (Phase::Closed, None) => f.write_str("Disconnected"),
            (Phase::Connecting, _) if self.failures > 0 => f.write_str("Reconnecting…"),
            (Phase::Connecting, _) => f.write_str("Connecting…"),
        }
    }
}

/// One finished attempt, as reported to subscribers.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source_name: String,
    pub method: String,
    /// Inbound path and query.
    pub path: String,
    /// URL the attempt was replayed against, when a route existed.
    pub local_url: Option<String>,
    pub event_id: Option<String>,
    pub result: AttemptResult,
}

impl Delivery {
    pub fn new(attempt: &InboundAttempt, route: Option<&Route>, result: AttemptResult) -> Self {
        Self {
            source_name: route.map(|r| r.source_name.clone()).unwrap_or_default(),
            method: attempt.method.clone(),
            path: attempt.path_and_query(),
            local_url: route.map(|r| r.target_url(&attempt.path, attempt.query.as_deref()).to_string()),
            event_id: attempt.event_id.clone(),
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Delivery(Arc<Delivery>),
    /// A result could not be handed to the dispatcher.
    Unreported { attempt_id: String },
    /// Human-readable notice from the dispatcher or the core.
    Notice(String),
}

#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<Event>,
    state: Arc<watch::Sender<TransportState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(TransportState::default());
        Self {
            events,
            state: Arc::new(state),
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.publish(Event::Notice(message.into()));
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    pub fn update_state(&self, f: impl FnOnce(&mut TransportState)) {
        self.state.send_modify(f);
    }

    pub fn state(&self) -> TransportState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            events: self.events.subscribe(),
            state: self.state.subscribe(),
        }
    }
}

pub struct Subscription {
    pub events: broadcast::Receiver<Event>,
    pub state: watch::Receiver<TransportState>,
}
