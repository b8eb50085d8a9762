//! Lifecycle of one `listen` run: start the core, keep the socket alive
//! across session rejections, then shut everything down in order.

use std::sync::Arc;
use std::time::Duration;

use hookrelay::api::ApiClient;
use hookrelay::event::{Event, EventBus};
use hookrelay::pipeline::{Forwarder, Pipeline, PipelineConfig, PipelineReport, inbound_channel};
use hookrelay::route::RouteTable;
use hookrelay::session::{BootstrapRequest, Bootstrapper, Session};
use hookrelay::transport::message::Frame;
use hookrelay::transport::{Endpoint, Transport, TransportConfig, TransportError, outbound_channel};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::listen::ListenError;
use crate::signal;
use crate::ui::{self, Header, Mode, UiContext};

pub struct Settings {
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
    pub outbound_capacity: usize,
    /// How long the pipeline waits for room in the outbound queue.
    pub result_queue_timeout: Duration,
}

/// What happened to the deliveries of a run that shut down on its own terms.
#[derive(Debug, Default)]
pub struct Summary {
    pub report: PipelineReport,
    /// Results left queued when the socket closed that the REST fallback
    /// could not deliver either.
    pub unreported_after_close: Vec<String>,
}

impl Summary {
    pub fn unreported(&self) -> Vec<&str> {
        self.report
            .unreported
            .iter()
            .map(|r| r.attempt_id.as_str())
            .chain(self.unreported_after_close.iter().map(String::as_str))
            .collect()
    }

    pub fn exit_code(&self) -> u8 {
        if self.report.shutdown_timeouts > 0 || !self.unreported().is_empty() {
            1
        } else {
            0
        }
    }
}

pub struct Supervisor {
    pub bootstrapper: Bootstrapper,
    pub request: BootstrapRequest,
    pub api: ApiClient,
    pub settings: Settings,
    pub mode: Mode,
    pub header: Header,
}

impl Supervisor {
    pub async fn run(self, session: Session) -> Result<Summary, ListenError> {
        let Supervisor {
            bootstrapper,
            request,
            api,
            settings,
            mode,
            header,
        } = self;

        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let ui_done = CancellationToken::new();

        let (routes_tx, routes_rx) = watch::channel(Arc::new(session.routes.clone()));
        let (inbound_tx, inbound_rx) = inbound_channel(&settings.pipeline);
        let (sink, outbound_rx) = outbound_channel(settings.outbound_capacity, settings.result_queue_timeout);
        let (in_flight_tx, in_flight_rx) = watch::channel(0);

        let forwarder = Forwarder::new(settings.pipeline.request_timeout, settings.pipeline.max_body_bytes)
            .map_err(|e| ListenError::Runtime(e.into()))?;
        let pipeline = Pipeline::new(
            settings.pipeline.clone(),
            forwarder,
            routes_rx.clone(),
            sink,
            bus.clone(),
            in_flight_tx,
        )
        .with_fallback(api.clone());
        let mut pipeline = tokio::spawn(pipeline.run(inbound_rx, cancel.clone()));

        let signals = tokio::spawn({
            let cancel = cancel.clone();
            let force = force.clone();
            async move {
                if let Err(e) = signal::watch_signals(cancel, force).await {
                    error!("Failed to install signal handlers: {}", e);
                }
            }
        });

        if mode == Mode::Log {
            print_routes(&session.routes);
        }
        let ui = tokio::spawn(ui::run(
            mode,
            UiContext {
                header,
                routes: routes_rx,
                api: api.clone(),
                cancel: cancel.clone(),
                force: force.clone(),
                done: ui_done.clone(),
            },
            bus.subscribe(),
        ));

        let mut transport = Transport::new(settings.transport, bus.clone(), inbound_tx, outbound_rx, in_flight_rx);
        let endpoint = session.endpoint();

        let outcome = tokio::select! {
            outcome = async {
                let outcome = keep_alive(&mut transport, endpoint, &bootstrapper, &request, &bus, &routes_tx, &cancel).await;

                // Whatever ended the transport, the rest shuts down the same way.
                cancel.cancel();
                transport.release_inbound();
                let report = match (&mut pipeline).await {
                    Ok(report) => report,
                    Err(e) => {
                        error!("Delivery pipeline panicked: {}", e);
                        PipelineReport::default()
                    }
                };
                let unreported_after_close = submit_unsent(&mut transport, &api, &bus).await;
                outcome.map(|()| Summary {
                    report,
                    unreported_after_close,
                })
            } => outcome,
            _ = force.cancelled() => {
                warn!("Skipping the drain, in-flight deliveries are abandoned");
                pipeline.abort();
                Err(ListenError::Interrupted)
            }
        };

        ui_done.cancel();
        if let Err(e) = ui.await {
            error!("Status UI panicked: {}", e);
        }
        signals.abort();
        outcome
    }
}

/// Run the transport until it stops for good, renewing the session each
/// time the dispatcher rejects it.
async fn keep_alive(
    transport: &mut Transport,
    mut endpoint: Endpoint,
    bootstrapper: &Bootstrapper,
    request: &BootstrapRequest,
    bus: &EventBus,
    routes: &watch::Sender<Arc<RouteTable>>,
    cancel: &CancellationToken,
) -> Result<(), ListenError> {
    // Welcome count at the last session rejection.
    let mut rejected_at: Option<u64> = None;
    loop {
        match transport.run(&endpoint, cancel).await {
            Ok(()) => return Ok(()),
            Err(TransportError::ReauthRequired) => {
                let welcomes = transport.welcomes();
                if rejected_at == Some(welcomes) {
                    return Err(ListenError::ReauthRequired(
                        "the new session was rejected before it was accepted".into(),
                    ));
                }
                rejected_at = Some(welcomes);

                bus.notice("Session expired, re-authenticating");
                let renewed = tokio::select! {
                    result = bootstrapper.bootstrap(request) => result,
                    _ = cancel.cancelled() => return Ok(()),
                };
                match renewed {
                    Ok(session) => {
                        info!("Session renewed as {}", session.id);
                        endpoint = session.endpoint();
                        routes.send_replace(Arc::new(session.routes));
                    }
                    Err(e) => return Err(ListenError::ReauthRequired(e.to_string())),
                }
            }
            Err(e) => return Err(ListenError::Runtime(e.into())),
        }
    }
}

/// Hand results the socket never carried to the control plane. Returns the
/// attempt ids that could not be submitted either.
async fn submit_unsent(transport: &mut Transport, api: &ApiClient, bus: &EventBus) -> Vec<String> {
    let mut unreported = Vec::new();
    for frame in transport.drain_unsent() {
        let Frame::AttemptResult(result) = frame else {
            debug!("Dropping unsent {} frame", frame.name());
            continue;
        };
        if let Err(e) = api.submit_attempt_result(&result).await {
            warn!(attempt_id = %result.attempt_id, "Result fallback failed: {}", e);
            bus.publish(Event::Unreported {
                attempt_id: result.attempt_id.clone(),
            });
            unreported.push(result.attempt_id);
        }
    }
    unreported
}

fn print_routes(routes: &RouteTable) {
    for route in routes.sorted() {
        println!(
            "{} {} -> {}",
            route.source_name,
            route.source_url.as_deref().unwrap_or("-"),
            route.local
        );
    }
}

/// Printed once the terminal is back to normal.
pub fn print_summary(summary: &Summary) {
    let report = &summary.report;
    println!(
        "Delivered {}, failed {} ({} unknown route, {} cut off by shutdown)",
        report.delivered, report.failed, report.unknown_route, report.shutdown_timeouts
    );
    let unreported = summary.unreported();
    if !unreported.is_empty() {
        println!(
            "{} results never reached hookrelay: {}",
            unreported.len(),
            unreported.join(", ")
        );
    }
}
