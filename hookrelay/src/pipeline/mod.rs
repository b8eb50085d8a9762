//! Turns inbound attempts into local HTTP requests and their results into
//! outbound frames.
//!
//! A single dispatcher task owns the in-flight map and the worker set. It
//! only pulls a new attempt off the inbound queue while a worker slot is
//! free, so a saturated pool leaves attempts in the bounded queue and,
//! once that fills up, pushes back on the transport. Results are finalized
//! by the dispatcher in the order workers complete.

mod forward;
mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use forward::{FORWARDED_ATTEMPT_ID, FORWARDED_SOURCE, Forwarder, is_hop_by_hop};

use crate::api::ApiClient;
use crate::attempt::{AttemptResult, ErrorClass, InboundAttempt, SHUTDOWN_REASON, UNKNOWN_ROUTE_REASON};
use crate::event::{Delivery, Event, EventBus};
use crate::route::{Route, RouteTable};
use crate::transport::OutboundSink;
use crate::transport::message::{AttemptResultFrame, Frame};

/// Time aborted workers get to hand back a result after the deadline.
const ABORT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub drain_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_capacity: 256,
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 1024 * 1024,
            drain_deadline: Duration::from_secs(10),
        }
    }
}

/// Bounded queue between the transport and the pipeline.
pub fn inbound_channel(config: &PipelineConfig) -> (mpsc::Sender<InboundAttempt>, mpsc::Receiver<InboundAttempt>) {
    mpsc::channel(config.queue_capacity.max(1))
}

/// Totals over a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Attempts that got an HTTP response, whatever the status.
    pub delivered: u64,
    /// Attempts that ended with an error class.
    pub failed: u64,
    pub unknown_route: u64,
    /// Attempts cut off by shutdown.
    pub shutdown_timeouts: u64,
    /// Results neither the transport nor the fallback accepted.
    pub unreported: Vec<AttemptResult>,
}

impl PipelineReport {
    pub fn total(&self) -> u64 {
        self.delivered + self.failed
    }
}

struct Job {
    attempt: InboundAttempt,
    route: Option<Arc<Route>>,
    started: Instant,
}

pub struct Pipeline {
    config: PipelineConfig,
    forwarder: Forwarder,
    routes: watch::Receiver<Arc<RouteTable>>,
    sink: OutboundSink,
    fallback: Option<ApiClient>,
    bus: EventBus,
    in_flight: watch::Sender<usize>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        forwarder: Forwarder,
        routes: watch::Receiver<Arc<RouteTable>>,
        sink: OutboundSink,
        bus: EventBus,
        in_flight: watch::Sender<usize>,
    ) -> Self {
        Self {
            config,
            forwarder,
            routes,
            sink,
            fallback: None,
            bus,
            in_flight,
        }
    }

    /// Submit results over the control plane when the outbound queue
    /// refuses them.
    pub fn with_fallback(mut self, api: ApiClient) -> Self {
        self.fallback = Some(api);
        self
    }

    /// Consume attempts until `cancel` fires (or the transport goes away),
    /// then give in-flight attempts until the drain deadline.
    ///
    /// Once cancelled, attempts still queued (or handed over late by the
    /// transport) are not dispatched; each is reported as cut off by
    /// shutdown. The queue is read until the transport drops its sender.
    ///
    /// The outbound sink is dropped on return, which is how the transport
    /// learns that no more results are coming.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundAttempt>, cancel: CancellationToken) -> PipelineReport {
        let mut workers: JoinSet<AttemptResult> = JoinSet::new();
        let mut jobs: HashMap<Id, Job> = HashMap::new();
        let hard_stop = CancellationToken::new();
        let mut report = PipelineReport::default();
        let mut accepting = true;
        let mut deadline: Option<Instant> = None;

        loop {
            if !accepting && jobs.is_empty() {
                break;
            }
            let draining = deadline.is_some();
            let has_room = draining || jobs.len() < self.config.workers.max(1);

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !draining => {
                    if !jobs.is_empty() {
                        info!("Waiting for {} in-flight attempts", jobs.len());
                    }
                    deadline = Some(Instant::now() + self.config.drain_deadline);
                }

                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    self.on_joined(joined, &mut jobs, &mut report).await;
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if draining => {
                    warn!("Drain deadline reached with {} attempts in flight", jobs.len());
                    break;
                }

                attempt = inbound.recv(), if accepting && has_room => match attempt {
                    Some(attempt) if draining => self.cut_off(attempt, &mut report).await,
                    Some(attempt) => self.start(attempt, &mut workers, &mut jobs, &hard_stop, &mut report).await,
                    None => accepting = false,
                },
            }
        }

        inbound.close();
        while let Ok(attempt) = inbound.try_recv() {
            self.cut_off(attempt, &mut report).await;
        }

        if !jobs.is_empty() {
            hard_stop.cancel();
            let grace = sleep(ABORT_GRACE);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    joined = workers.join_next_with_id() => match joined {
                        Some(joined) => self.on_joined(joined, &mut jobs, &mut report).await,
                        None => break,
                    },
                    _ = &mut grace => break,
                }
            }
            workers.abort_all();
            while let Some(joined) = workers.join_next_with_id().await {
                self.on_joined(joined, &mut jobs, &mut report).await;
            }
        }

        info!(
            delivered = report.delivered,
            failed = report.failed,
            unknown_route = report.unknown_route,
            unreported = report.unreported.len(),
            "Pipeline stopped"
        );
        report
    }

    async fn start(
        &self,
        attempt: InboundAttempt,
        workers: &mut JoinSet<AttemptResult>,
        jobs: &mut HashMap<Id, Job>,
        hard_stop: &CancellationToken,
        report: &mut PipelineReport,
    ) {
        let route = self.routes.borrow().get(&attempt.connection_id);
        let Some(route) = route else {
            warn!(
                attempt_id = %attempt.attempt_id,
                connection_id = %attempt.connection_id,
                "No route for connection"
            );
            let result = AttemptResult::failed(&attempt, ErrorClass::LocalNonhttp, UNKNOWN_ROUTE_REASON, Duration::ZERO);
            let job = Job {
                attempt,
                route: None,
                started: Instant::now(),
            };
            self.finalize(&job, result, report).await;
            return;
        };

        debug!(attempt_id = %attempt.attempt_id, "{} {}", attempt.method, attempt.path_and_query());
        let forwarder = self.forwarder.clone();
        let cancel = hard_stop.child_token();
        let task_attempt = attempt.clone();
        let task_route = route.clone();
        let handle = workers.spawn(async move { forwarder.forward(&task_attempt, &task_route, &cancel).await });

        jobs.insert(
            handle.id(),
            Job {
                attempt,
                route: Some(route),
                started: Instant::now(),
            },
        );
        self.in_flight.send_replace(jobs.len());
    }

    /// Settle an attempt that arrived after shutdown began without dispatching it.
    async fn cut_off(&self, attempt: InboundAttempt, report: &mut PipelineReport) {
        debug!(attempt_id = %attempt.attempt_id, "Shutting down, not dispatching attempt");
        let route = self.routes.borrow().get(&attempt.connection_id);
        let result = AttemptResult::failed(&attempt, ErrorClass::Timeout, SHUTDOWN_REASON, Duration::ZERO);
        let job = Job {
            attempt,
            route,
            started: Instant::now(),
        };
        self.finalize(&job, result, report).await;
    }

    async fn on_joined(
        &self,
        joined: Result<(Id, AttemptResult), JoinError>,
        jobs: &mut HashMap<Id, Job>,
        report: &mut PipelineReport,
    ) {
        let (id, outcome) = match joined {
            Ok((id, result)) => (id, Ok(result)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(job) = jobs.remove(&id) else {
            return;
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                AttemptResult::failed(&job.attempt, ErrorClass::Timeout, SHUTDOWN_REASON, job.started.elapsed())
            }
            Err(e) => {
                warn!(attempt_id = %job.attempt.attempt_id, "Worker panicked: {}", e);
                AttemptResult::failed(&job.attempt, ErrorClass::LocalNonhttp, "internal error", job.started.elapsed())
            }
        };
        self.finalize(&job, result, report).await;
        self.in_flight.send_replace(jobs.len());
    }

    /// Record the result, hand it to the transport and tell subscribers.
    async fn finalize(&self, job: &Job, result: AttemptResult, report: &mut PipelineReport) {
        if result.reason.as_deref() == Some(UNKNOWN_ROUTE_REASON) {
            report.unknown_route += 1;
        }
        if result.is_shutdown_timeout() {
            report.shutdown_timeouts += 1;
        }
        if result.error.is_some() {
            report.failed += 1;
        } else {
            report.delivered += 1;
        }

        let mut unreported = false;
        if let Err(e) = self.sink.send(Frame::from(&result)).await {
            warn!(attempt_id = %result.attempt_id, "Could not queue result: {}", e);
            if !self.submit_fallback(&result).await {
                report.unreported.push(result.clone());
                unreported = true;
            }
        }

        let attempt_id = result.attempt_id.clone();
        let delivery = Delivery::new(&job.attempt, job.route.as_deref(), result);
        self.bus.publish(Event::Delivery(Arc::new(delivery)));
        if unreported {
            self.bus.publish(Event::Unreported { attempt_id });
        }
    }

    async fn submit_fallback(&self, result: &AttemptResult) -> bool {
        let Some(api) = &self.fallback else {
            return false;
        };
        match api.submit_attempt_result(&AttemptResultFrame::from(result)).await {
            Ok(()) => {
                debug!(attempt_id = %result.attempt_id, "Result submitted over the control plane");
                true
            }
            Err(e) => {
                warn!(attempt_id = %result.attempt_id, "Fallback submission failed: {}", e);
                false
            }
        }
    }
}
