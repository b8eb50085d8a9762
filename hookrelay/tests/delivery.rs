mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use hookrelay::attempt::{ErrorClass, InboundAttempt, SHUTDOWN_REASON};
use hookrelay::event::{Event, EventBus};
use hookrelay::pipeline::{Forwarder, Pipeline, PipelineConfig, PipelineReport, inbound_channel};
use hookrelay::transport::message::{AttemptChunk, AttemptResultFrame, Frame};
use hookrelay::transport::{TransportConfig, outbound_channel};

use common::{FakeDispatcher, Harness, Reply, SESSION_ID, attempt_frame, closed_port, local_server, routes_to};

/// Run `attempts` through a pipeline with no websocket in front of it.
async fn run_pipeline(
    local: &Url,
    config: PipelineConfig,
    attempts: Vec<InboundAttempt>,
) -> (Vec<AttemptResultFrame>, PipelineReport) {
    let (_routes_tx, routes) = watch::channel(routes_to(local));
    let (sink, mut outbound) = outbound_channel(64, Duration::from_secs(1));
    let (in_flight_tx, _in_flight) = watch::channel(0);
    let forwarder = Forwarder::new(config.request_timeout, config.max_body_bytes).unwrap();
    let pipeline = Pipeline::new(config.clone(), forwarder, routes, sink, EventBus::new(), in_flight_tx);

    let (tx, rx) = inbound_channel(&config);
    for attempt in attempts {
        tx.send(attempt).await.unwrap();
    }
    drop(tx);
    let report = pipeline.run(rx, CancellationToken::new()).await;

    let mut results = Vec::new();
    while let Some(frame) = outbound.recv().await {
        if let Frame::AttemptResult(result) = frame {
            results.push(result);
        }
    }
    (results, report)
}

#[tokio::test]
async fn test_happy_path_round_trip() {
    let mut local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );
    let mut sub = harness.bus.subscribe();

    let mut conn = dispatcher.accept().await;
    assert_eq!(conn.header("authorization"), Some("Bearer tok_test"));
    assert_eq!(conn.header("x-session-id"), Some(SESSION_ID));
    let hello = conn.accept_session().await;
    assert_eq!(hello.session_id, SESSION_ID);

    conn.send(&Frame::Attempt(attempt_frame("att_1", "/webhook", br#"{"x":1}"#)))
        .await;
    let result = conn.expect_result().await;
    assert_eq!(result.attempt_id, "att_1");
    assert_eq!(result.status, Some(200));
    assert_eq!(result.body, Bytes::from_static(b"ok"));
    assert_eq!(result.error, None);
    assert!(!result.truncated);

    let request = local.requests.recv().await.unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.uri, "/webhook");
    assert_eq!(request.body, Bytes::from_static(br#"{"x":1}"#));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("x-forwarded-source"), Some("orders"));
    assert_eq!(request.header("x-forwarded-attempt-id"), Some("att_1"));
    assert_eq!(request.header("host"), Some(local.addr.to_string().as_str()));

    let delivery = loop {
        if let Event::Delivery(delivery) = sub.events.recv().await.unwrap() {
            break delivery;
        }
    };
    assert!(delivery.result.elapsed > Duration::ZERO);
    assert_eq!(delivery.source_name, "orders");
    assert_eq!(delivery.event_id.as_deref(), Some("evt_att_1"));
    assert_eq!(
        delivery.local_url.as_deref(),
        Some(format!("http://{}/webhook", local.addr).as_str())
    );

    harness.cancel.cancel();
    assert!(matches!(conn.recv().await, Some(Frame::Bye(_))));
    let (outcome, unsent) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
    assert!(unsent.is_empty());
    let report = harness.pipeline.await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.unreported.is_empty());
}

#[tokio::test]
async fn test_local_down_is_connect_error() {
    let addr = closed_port().await;
    let local = Url::parse(&format!("http://{addr}/")).unwrap();
    let config = PipelineConfig::default();
    let timeout = config.request_timeout;
    let attempt = attempt_frame("att_1", "/webhook", b"{}").into();

    let (results, report) = run_pipeline(&local, config, vec![attempt]).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error, Some(ErrorClass::Connect));
    assert_eq!(results[0].status, None);
    assert!(Duration::from_millis(results[0].elapsed_ms) < timeout);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_slow_local_times_out() {
    let local = local_server(|_| Reply::ok("late").delayed(Duration::from_secs(60))).await;
    let config = PipelineConfig {
        request_timeout: Duration::from_secs(2),
        ..PipelineConfig::default()
    };
    let attempt = attempt_frame("att_1", "/webhook", b"{}").into();

    let (results, _) = run_pipeline(&local.url(), config, vec![attempt]).await;
    assert_eq!(results[0].error, Some(ErrorClass::Timeout));
    assert_eq!(results[0].status, None);
    assert!(
        (1900..=2600).contains(&results[0].elapsed_ms),
        "elapsed {}ms",
        results[0].elapsed_ms
    );
}

#[tokio::test]
async fn test_large_body_is_truncated() {
    let big = Bytes::from(vec![b'a'; 2 * 1024 * 1024]);
    let local = local_server(move |_| Reply {
        status: 200,
        body: big.clone(),
        delay: Duration::ZERO,
    })
    .await;
    let attempt = attempt_frame("att_1", "/webhook", b"{}").into();

    let (results, report) = run_pipeline(&local.url(), PipelineConfig::default(), vec![attempt]).await;
    assert_eq!(results[0].status, Some(200));
    assert_eq!(results[0].body.len(), 1024 * 1024);
    assert!(results[0].truncated);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_server_errors_are_deliveries() {
    let local = local_server(|_| Reply {
        status: 503,
        body: Bytes::from_static(b"busy"),
        delay: Duration::ZERO,
    })
    .await;
    let attempt = attempt_frame("att_1", "/webhook", b"{}").into();

    let (results, report) = run_pipeline(&local.url(), PipelineConfig::default(), vec![attempt]).await;
    assert_eq!(results[0].status, Some(503));
    assert_eq!(results[0].error, None);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_base_path_and_query_are_kept() {
    let mut local = local_server(|_| Reply::ok("ok")).await;
    let base = Url::parse(&format!("http://{}/api/hooks/", local.addr)).unwrap();
    let mut frame = attempt_frame("att_1", "/stripe", b"{}");
    frame.query = Some("retry=1&x=%20".into());
    frame.method = "PUT".into();

    let (results, _) = run_pipeline(&base, PipelineConfig::default(), vec![frame.into()]).await;
    assert_eq!(results[0].status, Some(200));
    let request = local.requests.recv().await.unwrap();
    assert_eq!(request.method, "PUT");
    assert_eq!(request.uri, "/api/hooks/stripe?retry=1&x=%20");
}

#[tokio::test]
async fn test_results_follow_completion_order() {
    let local = local_server(|request| {
        let delay = if request.uri == "/slow" { 400 } else { 0 };
        Reply::ok("ok").delayed(Duration::from_millis(delay))
    })
    .await;
    let attempts = vec![
        attempt_frame("att_slow", "/slow", b"{}").into(),
        attempt_frame("att_fast", "/fast", b"{}").into(),
    ];

    let (results, _) = run_pipeline(&local.url(), PipelineConfig::default(), attempts).await;
    let order: Vec<_> = results.iter().map(|r| r.attempt_id.as_str()).collect();
    assert_eq!(order, vec!["att_fast", "att_slow"]);
}

#[tokio::test]
async fn test_chunked_attempt_is_reassembled() {
    let mut local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;

    let mut head = attempt_frame("att_1", "/webhook", b"{\"items\":");
    head.more_chunks = true;
    conn.send(&Frame::Attempt(head)).await;
    for (seq, data, last) in [(0, &b"[1,2"[..], false), (1, &b",3]}"[..], true)] {
        conn.send(&Frame::AttemptChunk(AttemptChunk {
            attempt_id: "att_1".into(),
            seq,
            data: Bytes::copy_from_slice(data),
            last,
        }))
        .await;
    }

    let result = conn.expect_result().await;
    assert_eq!(result.status, Some(200));
    let request = local.requests.recv().await.unwrap();
    assert_eq!(request.body, Bytes::from_static(b"{\"items\":[1,2,3]}"));

    harness.cancel.cancel();
    let (outcome, _) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_queued_attempts_are_cut_off_on_shutdown() {
    let local = local_server(|_| Reply::ok("ok").delayed(Duration::from_millis(300))).await;
    let config = PipelineConfig {
        workers: 1,
        ..PipelineConfig::default()
    };
    let (_routes_tx, routes) = watch::channel(routes_to(&local.url()));
    let (sink, mut outbound) = outbound_channel(64, Duration::from_secs(1));
    let (in_flight_tx, _in_flight) = watch::channel(0);
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let forwarder = Forwarder::new(config.request_timeout, config.max_body_bytes).unwrap();
    let pipeline = Pipeline::new(config.clone(), forwarder, routes, sink, bus, in_flight_tx);

    let (tx, rx) = inbound_channel(&config);
    let cancel = CancellationToken::new();
    let running = tokio::spawn(pipeline.run(rx, cancel.clone()));
    for i in 0..3 {
        tx.send(attempt_frame(&format!("att_{i}"), "/webhook", b"{}").into())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    // Handed over by the transport after shutdown began.
    tx.send(attempt_frame("att_3", "/webhook", b"{}").into()).await.unwrap();
    drop(tx);

    let report = running.await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 3);
    assert_eq!(report.shutdown_timeouts, 3);
    assert!(report.unreported.is_empty());

    let mut results = Vec::new();
    while let Some(frame) = outbound.recv().await {
        if let Frame::AttemptResult(result) = frame {
            results.push(result);
        }
    }
    results.sort_by(|a, b| a.attempt_id.cmp(&b.attempt_id));
    let ids: Vec<_> = results.iter().map(|r| r.attempt_id.as_str()).collect();
    assert_eq!(ids, vec!["att_0", "att_1", "att_2", "att_3"]);
    assert_eq!(results[0].status, Some(200));
    for result in &results[1..] {
        assert_eq!(result.error, Some(ErrorClass::Timeout));
        assert_eq!(result.reason.as_deref(), Some(SHUTDOWN_REASON));
    }

    let mut delivered = Vec::new();
    while let Ok(event) = sub.events.try_recv() {
        if let Event::Delivery(delivery) = event {
            assert_eq!(delivery.source_name, "orders");
            delivered.push(delivery.result.attempt_id.clone());
        }
    }
    assert_eq!(delivered.len(), 4);
}
