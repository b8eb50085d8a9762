mod common;

use std::time::Duration;

use serde_json::Map;
use tokio::time::{Instant, timeout};

use hookrelay::attempt::{ErrorClass, SHUTDOWN_REASON, UNKNOWN_ROUTE_REASON};
use hookrelay::event::Phase;
use hookrelay::pipeline::PipelineConfig;
use hookrelay::transport::message::{Control, ControlKind, Frame, Heartbeat, Welcome};
use hookrelay::transport::{TransportConfig, TransportError};

use common::{FakeDispatcher, Harness, Reply, SESSION_ID, attempt_frame, local_server, routes_to};

#[tokio::test]
async fn test_reconnects_after_socket_drop() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    conn.close(1011).await;
    drop(conn);
    let dropped_at = Instant::now();

    let mut conn = dispatcher.accept().await;
    assert!(
        dropped_at.elapsed() <= Duration::from_millis(1500),
        "reconnected after {:?}",
        dropped_at.elapsed()
    );
    let hello = conn.accept_session().await;
    assert_eq!(hello.session_id, SESSION_ID);

    conn.send(&Frame::Attempt(attempt_frame("att_2", "/webhook", b"{}")))
        .await;
    let result = conn.expect_result().await;
    assert_eq!(result.status, Some(200));

    let state = harness.bus.state();
    assert_eq!(state.phase, Phase::Open);
    assert_eq!(state.failures, 1);

    harness.cancel.cancel();
    let (outcome, _) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_unanswered_pings_drop_the_socket() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.expect_hello().await;
    conn.welcome(Some(100)).await;

    let mut pings = 0;
    while let Some(frame) = timeout(Duration::from_secs(2), conn.recv_raw()).await.unwrap() {
        if let Frame::Ping(_) = frame {
            pings += 1;
        }
    }
    assert!(pings >= 2, "saw {pings} pings");

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    harness.cancel.cancel();
    let (outcome, _) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_answered_pings_keep_the_socket() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.expect_hello().await;
    conn.welcome(Some(100)).await;

    let quiet = timeout(Duration::from_millis(700), conn.recv()).await;
    assert!(quiet.is_err(), "socket closed: {quiet:?}");
    assert!(harness.bus.state().last_pong.is_some());

    harness.cancel.cancel();
}

#[tokio::test]
async fn test_dispatcher_ping_is_answered() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    conn.ping(7).await;
    assert_eq!(conn.recv_raw().await, Some(Frame::Pong(Heartbeat { token: 7 })));

    harness.cancel.cancel();
}

#[tokio::test]
async fn test_reauth_close_code_stops_the_transport() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    conn.close(4001).await;

    let (outcome, _) = timeout(Duration::from_secs(5), harness.transport).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(TransportError::ReauthRequired)));
    assert!(harness.bus.state().reauthenticating);
    harness.cancel.cancel();
}

#[tokio::test]
async fn test_invalid_session_in_welcome() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.expect_hello().await;
    conn.send(&Frame::Welcome(Welcome {
        session_id: SESSION_ID.into(),
        heartbeat_interval_ms: None,
        notice: None,
        session_valid: false,
        extra: Map::new(),
    }))
    .await;

    let (outcome, _) = timeout(Duration::from_secs(5), harness.transport).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(TransportError::ReauthRequired)));
    harness.cancel.cancel();
}

#[tokio::test]
async fn test_server_drain_waits_for_in_flight() {
    let local = local_server(|_| Reply::ok("ok").delayed(Duration::from_millis(300))).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    conn.send(&Frame::Attempt(attempt_frame("att_1", "/webhook", b"{}")))
        .await;
    // Let the attempt reach the pipeline before asking for the drain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.send(&Frame::Control(Control {
        kind: ControlKind::Drain,
        message: None,
        extra: Map::new(),
    }))
    .await;

    let result = conn.expect_result().await;
    assert_eq!(result.status, Some(200));
    assert!(matches!(conn.recv().await, Some(Frame::Bye(_))));

    // A drained socket is replaced, not the end of the session.
    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;

    harness.cancel.cancel();
    let (outcome, _) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_full_queue_pauses_reads_without_dropping() {
    let local = local_server(|_| Reply::ok("ok").delayed(Duration::from_millis(100))).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let config = PipelineConfig {
        workers: 1,
        queue_capacity: 1,
        ..PipelineConfig::default()
    };
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        config,
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    for i in 0..6 {
        conn.send(&Frame::Attempt(attempt_frame(&format!("att_{i}"), "/webhook", b"{}")))
            .await;
    }

    let mut seen = Vec::new();
    for _ in 0..6 {
        let result = timeout(Duration::from_secs(10), conn.expect_result()).await.unwrap();
        assert_eq!(result.status, Some(200));
        seen.push(result.attempt_id);
    }
    seen.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("att_{i}")).collect();
    assert_eq!(seen, expected);

    harness.cancel.cancel();
    let report = harness.pipeline.await.unwrap();
    assert_eq!(report.delivered, 6);
}

#[tokio::test]
async fn test_stalled_attempt_is_settled_on_shutdown() {
    let local = local_server(|_| Reply::ok("ok").delayed(Duration::from_millis(300))).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let config = PipelineConfig {
        workers: 1,
        queue_capacity: 1,
        ..PipelineConfig::default()
    };
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        config,
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    // One in flight, one queued, one held by the paused reader, one unread.
    for i in 0..4 {
        conn.send(&Frame::Attempt(attempt_frame(&format!("att_{i}"), "/webhook", b"{}")))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.cancel.cancel();

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(timeout(Duration::from_secs(5), conn.expect_result()).await.unwrap());
    }
    assert!(matches!(conn.recv().await, Some(Frame::Bye(_))));
    results.sort_by(|a, b| a.attempt_id.cmp(&b.attempt_id));
    assert_eq!(results[0].attempt_id, "att_0");
    assert_eq!(results[0].status, Some(200));
    for result in &results[1..] {
        assert_eq!(result.error, Some(ErrorClass::Timeout));
        assert_eq!(result.reason.as_deref(), Some(SHUTDOWN_REASON));
    }
    assert_eq!(results[1].attempt_id, "att_1");
    assert_eq!(results[2].attempt_id, "att_2");

    let (outcome, unsent) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
    assert!(unsent.is_empty());
    let report = harness.pipeline.await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.shutdown_timeouts, 2);
}

#[tokio::test]
async fn test_graceful_shutdown_flushes_in_flight() {
    let local = local_server(|_| Reply::ok("ok").delayed(Duration::from_millis(500))).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    for i in 0..4 {
        conn.send(&Frame::Attempt(attempt_frame(&format!("att_{i}"), "/webhook", b"{}")))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    harness.cancel.cancel();

    for _ in 0..4 {
        let result = conn.expect_result().await;
        assert_eq!(result.status, Some(200));
        assert_eq!(result.error, None);
    }
    assert!(matches!(conn.recv().await, Some(Frame::Bye(_))));

    let (outcome, unsent) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
    assert!(unsent.is_empty());
    let report = harness.pipeline.await.unwrap();
    assert_eq!(report.delivered, 4);
    assert_eq!(report.shutdown_timeouts, 0);
    assert!(report.unreported.is_empty());
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_drain_deadline_reports_shutdown_timeouts() {
    let local = local_server(|_| Reply::ok("late").delayed(Duration::from_secs(60))).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let pipeline_config = PipelineConfig {
        drain_deadline: Duration::from_secs(1),
        ..PipelineConfig::default()
    };
    let transport_config = TransportConfig {
        drain_deadline: Duration::from_secs(1),
        ..TransportConfig::default()
    };
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        pipeline_config,
        transport_config,
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    conn.send(&Frame::Attempt(attempt_frame("att_1", "/webhook", b"{}")))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    harness.cancel.cancel();

    let result = conn.expect_result().await;
    assert_eq!(result.error, Some(ErrorClass::Timeout));
    assert_eq!(result.reason.as_deref(), Some(SHUTDOWN_REASON));

    let (outcome, _) = harness.transport.await.unwrap();
    assert!(outcome.is_ok());
    let report = harness.pipeline.await.unwrap();
    assert_eq!(report.shutdown_timeouts, 1);
    assert!(cancelled_at.elapsed() < Duration::from_millis(2500));
}

#[tokio::test]
async fn test_unknown_route_is_reported() {
    let local = local_server(|_| Reply::ok("ok")).await;
    let mut dispatcher = FakeDispatcher::start().await;
    let harness = Harness::start(
        dispatcher.endpoint(),
        routes_to(&local.url()),
        PipelineConfig::default(),
        TransportConfig::default(),
    );

    let mut conn = dispatcher.accept().await;
    conn.accept_session().await;
    let mut frame = attempt_frame("att_1", "/webhook", b"{}");
    frame.connection_id = "web_gone".into();
    conn.send(&Frame::Attempt(frame)).await;

    let result = conn.expect_result().await;
    assert_eq!(result.error, Some(ErrorClass::LocalNonhttp));
    assert_eq!(result.reason.as_deref(), Some(UNKNOWN_ROUTE_REASON));

    harness.cancel.cancel();
    let report = harness.pipeline.await.unwrap();
    assert_eq!(report.unknown_route, 1);
}
