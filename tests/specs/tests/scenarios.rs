// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Acceptance scenarios driving the dispatch facade end-to-end with real
//! subprocess-backed providers.

use std::time::Duration;

use aviary::dispatch::StreamEventsRequest;
use aviary::error::ErrorKind;
use aviary::event::{EventKind, SessionState};

use aviary_specs::{
    admin_ctx, broker, broker_with, collect_stream, scoped_ctx, start_request,
    start_request_for, stream_at_least, uuid,
};

fn stream_req(session_id: &str, subscriber: Option<&str>, after_seq: u64) -> StreamEventsRequest {
    StreamEventsRequest {
        session_id: session_id.to_owned(),
        subscriber_id: subscriber.map(str::to_owned),
        after_seq,
    }
}

// Scenario 1: echo round-trip.
#[tokio::test]
async fn echo_round_trip() {
    let broker = broker().await;
    let ctx = admin_ctx();
    let id = uuid(1);

    let record =
        broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();
    assert_eq!(record.state, SessionState::Running);

    let input_seq = broker.dispatch.send_input(&ctx, &id, "hello").await.unwrap();

    // session_started, input_received, stdout.
    let events = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, None, 0),
        3,
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(events[0].kind, EventKind::SessionStarted);
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[1].kind, EventKind::InputReceived);
    assert_eq!(events[1].text, "hello");
    assert_eq!(events[2].kind, EventKind::Stdout);
    assert_eq!(events[2].text, "hello");
    assert!(events[2].seq > input_seq);
    for pair in events.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
    }

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Scenario 2: multi-input fan-out.
#[tokio::test]
async fn multi_input_fan_out() {
    let broker = broker().await;
    let ctx = admin_ctx();
    let id = uuid(2);
    broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();

    for n in 1..=3 {
        broker.dispatch.send_input(&ctx, &id, &format!("hello-{n}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // 1 started + 3 inputs + 3 stdout echoes.
    let events = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, None, 0),
        7,
        Duration::from_secs(10),
    )
    .await;

    let stdout_texts: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::Stdout)
        .map(|e| e.text.as_str())
        .collect();
    assert_eq!(stdout_texts.len(), 3);
    assert!(stdout_texts[0].contains("hello-1"));
    assert!(stdout_texts[1].contains("hello-2"));
    assert!(stdout_texts[2].contains("hello-3"));

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Scenario 3: disconnect, miss events, reconnect; replay resumes at K+1
// with no duplicates.
#[tokio::test]
async fn disconnect_reconnect_replay() {
    let broker = broker().await;
    let ctx = admin_ctx();
    let id = uuid(3);
    broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();
    broker.dispatch.send_input(&ctx, &id, "first").await.unwrap();

    // Subscriber s1 receives and acks through seq K, then detaches.
    let first_batch = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, Some("s1"), 0),
        3,
        Duration::from_secs(10),
    )
    .await;
    let k = first_batch.last().unwrap().seq;

    // Events appended while detached.
    broker.dispatch.send_input(&ctx, &id, "second").await.unwrap();

    // Reattach with afterSeq=0: the cursor dominates the request.
    let reattached = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, Some("s1"), 0),
        2,
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(reattached.first().unwrap().seq, k + 1);
    assert!(reattached.iter().all(|e| e.seq > k));

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Scenario 4: overflow detection with a 3-slot log.
#[tokio::test]
async fn overflow_detection() {
    let broker = broker_with(|policy| policy.event_buffer = 3).await;
    let ctx = admin_ctx();
    let id = uuid(4);
    broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();

    // Ack through seq 1 (session_started), then detach.
    let batch = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, Some("s1"), 0),
        1,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(batch[0].seq, 1);

    // Push sequences 2..=5 through the 3-slot ring: two inputs, each an
    // input_received plus a stdout echo.
    broker.dispatch.send_input(&ctx, &id, "a").await.unwrap();
    broker.dispatch.send_input(&ctx, &id, "b").await.unwrap();
    {
        let entry = broker.dispatch.supervisor().entry(&id).await.unwrap();
        for _ in 0..100 {
            if entry.log.last_seq() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(entry.log.oldest_seq(), 3);
    }

    // Reattach: buffer-overflow marker first, then the retained window.
    let reattached = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, Some("s1"), 0),
        4,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(reattached[0].kind, EventKind::BufferOverflow);
    let seqs: Vec<u64> = reattached[1..].iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![3, 4, 5]);

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Scenario 5: a token scoped to another project is denied everywhere.
#[tokio::test]
async fn permission_mismatch() {
    let broker = broker().await;
    let id = uuid(5);
    broker
        .dispatch
        .start_session(&admin_ctx(), start_request(&broker, &id, "A"))
        .await
        .unwrap();

    let foreign = scoped_ctx("B");
    assert_eq!(
        broker.dispatch.get_session(&foreign, &id).await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );
    assert_eq!(
        broker.dispatch.send_input(&foreign, &id, "hi").await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );
    assert_eq!(
        broker.dispatch.stop_session(&foreign, &id, false).await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );

    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let err = broker
        .dispatch
        .stream_events(
            &foreign,
            stream_req(&id, None, 0),
            tokio_util::sync::CancellationToken::new(),
            tx,
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);

    broker.dispatch.stop_session(&admin_ctx(), &id, false).await.unwrap();
}

// Scenario 6: a non-UUID session id is rejected with no side effects.
#[tokio::test]
async fn invalid_session_identifier() {
    let broker = broker().await;
    let ctx = admin_ctx();

    let before = broker.dispatch.list_sessions(&ctx, None).await.unwrap();
    let err = broker
        .dispatch
        .start_session(&ctx, start_request(&broker, "not-a-uuid", "projA"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    let after = broker.dispatch.list_sessions(&ctx, None).await.unwrap();
    assert_eq!(before.len(), after.len());
}

// JSON-lines provider: assistant text and end-of-turn markers.
#[tokio::test]
async fn json_lines_turn_cycle() {
    let broker = broker().await;
    let ctx = admin_ctx();
    let id = uuid(6);
    broker
        .dispatch
        .start_session(&ctx, start_request_for(&broker, &id, "projA", "scripted"))
        .await
        .unwrap();

    broker.dispatch.send_input(&ctx, &id, "write a test").await.unwrap();

    // started, ready, input, assistant stdout, response_complete.
    let events = stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, None, 0),
        5,
        Duration::from_secs(10),
    )
    .await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds[0], EventKind::SessionStarted);
    assert_eq!(kinds[1], EventKind::AgentReady);
    assert!(kinds.contains(&EventKind::Stdout));
    assert!(kinds.contains(&EventKind::ResponseComplete));

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Stopping twice produces exactly one terminal event.
#[tokio::test]
async fn stop_idempotence_end_to_end() {
    let broker = broker().await;
    let ctx = admin_ctx();
    let id = uuid(7);
    broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();

    let first = broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
    assert_eq!(first.state, SessionState::Stopped);
    let second = broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
    assert_eq!(second.state, SessionState::Stopped);

    let events = collect_stream(
        &broker.dispatch,
        &ctx,
        stream_req(&id, None, 0),
        Duration::from_millis(500),
    )
    .await;
    assert_eq!(events.iter().filter(|e| e.done).count(), 1);
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::SessionStopped).count(),
        1
    );
}

// Input-size boundaries: exactly the policy cap passes, one byte over is
// rejected; the hard cap is an invalid argument.
#[tokio::test]
async fn input_size_boundaries() {
    let broker = broker_with(|policy| policy.max_input_bytes = 16).await;
    let ctx = admin_ctx();
    let id = uuid(8);
    broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();

    let exact = "x".repeat(16);
    broker.dispatch.send_input(&ctx, &id, &exact).await.unwrap();

    let over = "x".repeat(17);
    assert_eq!(
        broker.dispatch.send_input(&ctx, &id, &over).await.err().unwrap().kind,
        ErrorKind::ResourceExhausted
    );

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Subscriber cap: at the cap new ids are rejected, reconnects succeed.
#[tokio::test]
async fn subscriber_cap_boundary() {
    let broker = broker_with(|policy| policy.subscriber_cap = 2).await;
    let ctx = admin_ctx();
    let id = uuid(9);
    broker.dispatch.start_session(&ctx, start_request(&broker, &id, "projA")).await.unwrap();

    for sub in ["s1", "s2"] {
        stream_at_least(
            &broker.dispatch,
            &ctx,
            stream_req(&id, Some(sub), 0),
            1,
            Duration::from_secs(10),
        )
        .await;
    }

    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let err = broker
        .dispatch
        .stream_events(
            &ctx,
            stream_req(&id, Some("s3"), 0),
            tokio_util::sync::CancellationToken::new(),
            tx,
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::ResourceExhausted);

    // An existing subscriber reconnects at the cap.
    stream_at_least(
        &broker.dispatch,
        &ctx,
        stream_req(&id, Some("s1"), 0),
        1,
        Duration::from_secs(10),
    )
    .await;

    broker.dispatch.stop_session(&ctx, &id, false).await.unwrap();
}

// Path allow-list boundary: the exact prefix is admitted, one byte short
// of it is not.
#[tokio::test]
async fn repo_path_prefix_boundary() {
    let broker = broker().await;
    let ctx = admin_ctx();

    // Exact prefix match.
    let mut req = start_request(&broker, &uuid(10), "projA");
    req.repo_path = broker.repo_path();
    broker.dispatch.start_session(&ctx, req).await.unwrap();

    // One byte shorter than the allowed prefix.
    let mut shorter = broker.repo_path();
    shorter.pop();
    let mut req = start_request(&broker, &uuid(11), "projA");
    req.repo_path = shorter;
    let err = broker.dispatch.start_session(&ctx, req).await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);

    broker.dispatch.stop_session(&ctx, &uuid(10), false).await.unwrap();
}
