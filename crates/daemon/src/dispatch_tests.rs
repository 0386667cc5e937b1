// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::SessionPolicy;
use crate::error::ErrorKind;
use crate::redact::noop_redactor;
use crate::test_support::{claims, echo_registry, session_uuid};

async fn dispatch() -> Dispatch {
    dispatch_with_policy(SessionPolicy {
        allowed_repo_paths: vec!["/".to_owned()],
        event_buffer: 16,
        subscriber_cap: 2,
        ..SessionPolicy::default()
    })
    .await
}

async fn dispatch_with_policy(policy: SessionPolicy) -> Dispatch {
    let registry = echo_registry().await;
    let supervisor = Arc::new(Supervisor::new(registry, policy, noop_redactor()));
    Dispatch::new(supervisor)
}

fn start_req(session_id: &str, project_id: &str) -> StartSessionRequest {
    StartSessionRequest {
        project_id: project_id.to_owned(),
        session_id: session_id.to_owned(),
        repo_path: "/srv/repo".to_owned(),
        provider_id: "echo".to_owned(),
        agent_opts: HashMap::new(),
    }
}

fn ctx() -> RequestContext {
    RequestContext::authenticated(claims(None))
}

fn scoped_ctx(project: &str) -> RequestContext {
    RequestContext::authenticated(claims(Some(project)))
}

/// Collect streamed events, cancelling once the stream stalls for `idle`.
async fn collect_events(
    dispatch: &Dispatch,
    ctx: &RequestContext,
    req: StreamEventsRequest,
    idle: Duration,
) -> Vec<SessionEvent> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);
    let fut = dispatch.stream_events(ctx, req, cancel.clone(), tx);
    tokio::pin!(fut);

    let mut events = Vec::new();
    let mut stream_done = false;
    loop {
        tokio::select! {
            result = &mut fut, if !stream_done => {
                result.unwrap();
                stream_done = true;
            }
            maybe = tokio::time::timeout(idle, rx.recv()) => {
                match maybe {
                    Ok(Some(ev)) => events.push(ev),
                    Ok(None) => break,
                    Err(_) => cancel.cancel(),
                }
            }
        }
    }
    events
}

#[tokio::test]
async fn start_session_round_trip() {
    let d = dispatch().await;
    let id = session_uuid(1);
    let record = d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();
    assert_eq!(record.session_id, id);
    assert_eq!(record.state, crate::event::SessionState::Running);
    assert!(record.created_at_ms > 0);
}

#[tokio::test]
async fn invalid_session_uuid_rejected_without_side_effects() {
    let d = dispatch().await;
    let err = d.start_session(&ctx(), start_req("not-a-uuid", "projA")).await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert!(d.list_sessions(&ctx(), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn oversize_and_control_fields_rejected() {
    let d = dispatch().await;
    let id = session_uuid(1);

    let mut req = start_req(&id, "projA");
    req.project_id = "p".repeat(MAX_PROJECT_ID_LEN + 1);
    assert_eq!(
        d.start_session(&ctx(), req).await.err().unwrap().kind,
        ErrorKind::InvalidArgument
    );

    let mut req = start_req(&id, "projA");
    req.provider_id = "ech\u{0}o".to_owned();
    assert_eq!(
        d.start_session(&ctx(), req).await.err().unwrap().kind,
        ErrorKind::InvalidArgument
    );

    let mut req = start_req(&id, "projA");
    req.agent_opts.insert("model".to_owned(), "bad\u{1}value".to_owned());
    assert_eq!(
        d.start_session(&ctx(), req).await.err().unwrap().kind,
        ErrorKind::InvalidArgument
    );
}

#[tokio::test]
async fn missing_claims_is_unauthenticated() {
    let d = dispatch().await;
    let anon = RequestContext::anonymous();
    let err = d.start_session(&anon, start_req(&session_uuid(1), "projA")).await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::Unauthenticated);
    assert_eq!(d.list_sessions(&anon, None).await.err().unwrap().kind, ErrorKind::Unauthenticated);
    assert_eq!(d.list_providers(&anon).await.err().unwrap().kind, ErrorKind::Unauthenticated);
}

#[tokio::test]
async fn project_scope_enforced_across_operations() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();

    let foreign = scoped_ctx("projB");
    assert_eq!(
        d.get_session(&foreign, &id).await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );
    assert_eq!(
        d.send_input(&foreign, &id, "hi").await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );
    assert_eq!(
        d.stop_session(&foreign, &id, false).await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );
    let (tx, _rx) = mpsc::channel(8);
    let err = d
        .stream_events(
            &foreign,
            StreamEventsRequest { session_id: id.clone(), subscriber_id: None, after_seq: 0 },
            CancellationToken::new(),
            tx,
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);

    // The scope that matches is admitted.
    assert!(d.get_session(&scoped_ctx("projA"), &id).await.is_ok());
}

#[tokio::test]
async fn scoped_start_must_match_token_project() {
    let d = dispatch().await;
    let err = d
        .start_session(&scoped_ctx("projB"), start_req(&session_uuid(1), "projA"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn list_sessions_scope_rules() {
    let d = dispatch().await;
    d.start_session(&ctx(), start_req(&session_uuid(1), "projA")).await.unwrap();
    d.start_session(&ctx(), start_req(&session_uuid(2), "projB")).await.unwrap();

    // Scoped token with no filter sees only its project.
    let listed = d.list_sessions(&scoped_ctx("projA"), None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].project_id, "projA");

    // Scoped token asking for another project is denied.
    assert_eq!(
        d.list_sessions(&scoped_ctx("projA"), Some("projB")).await.err().unwrap().kind,
        ErrorKind::PermissionDenied
    );

    // Unscoped token sees everything.
    assert_eq!(d.list_sessions(&ctx(), None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn input_hard_cap_is_invalid_argument() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();

    let huge = "x".repeat(MAX_INPUT_HARD_CAP + 1);
    let err = d.send_input(&ctx(), &id, &huge).await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn stream_replays_then_follows_live() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();

    let seq = d.send_input(&ctx(), &id, "hello").await.unwrap();
    assert!(seq >= 2);

    let events = collect_events(
        &d,
        &ctx(),
        StreamEventsRequest { session_id: id.clone(), subscriber_id: None, after_seq: 0 },
        Duration::from_millis(500),
    )
    .await;

    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.starts_with(&[EventKind::SessionStarted, EventKind::InputReceived]));
    assert!(kinds.contains(&EventKind::Stdout));
    // Sequences strictly increasing from 1.
    assert_eq!(events[0].seq, 1);
    for pair in events.windows(2) {
        assert!(pair[1].seq > pair[0].seq);
    }
}

#[tokio::test]
async fn stream_after_input_seq_skips_input_event() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();
    let seq = d.send_input(&ctx(), &id, "hello").await.unwrap();

    let events = collect_events(
        &d,
        &ctx(),
        StreamEventsRequest { session_id: id.clone(), subscriber_id: None, after_seq: seq },
        Duration::from_millis(500),
    )
    .await;

    assert!(events.iter().all(|e| e.seq > seq));
    assert!(events.iter().all(|e| e.kind != EventKind::InputReceived));
}

#[tokio::test]
async fn stream_ends_after_terminal_event() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();
    d.stop_session(&ctx(), &id, false).await.unwrap();

    // Wait for the terminal event to land in the log.
    for _ in 0..100 {
        let entry = d.supervisor().entry(&id).await.unwrap();
        if entry.log.after(0).iter().any(|e| e.done) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    d.stream_events(
        &ctx(),
        StreamEventsRequest { session_id: id.clone(), subscriber_id: None, after_seq: 0 },
        cancel,
        tx,
    )
    .await
    .unwrap();

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(events.last().map(|e| e.done).unwrap_or(false));

    // The listener is detached once the stream completes.
    let entry = d.supervisor().entry(&id).await.unwrap();
    assert_eq!(entry.log.listener_count(), 0);
}

#[tokio::test]
async fn subscriber_cap_applies_to_distinct_ids() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();

    let entry = d.supervisor().entry(&id).await.unwrap();
    entry.subscribers.attach(Some("a"), 0).unwrap();
    entry.subscribers.attach(Some("b"), 0).unwrap();

    let (tx, _rx) = mpsc::channel(8);
    let err = d
        .stream_events(
            &ctx(),
            StreamEventsRequest {
                session_id: id.clone(),
                subscriber_id: Some("c".to_owned()),
                after_seq: 0,
            },
            CancellationToken::new(),
            tx,
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn health_reports_without_claims() {
    let d = dispatch().await;
    let report = d.health().await;
    assert_eq!(report.status, "ok");
    assert_eq!(report.active_sessions, 0);
    assert_eq!(report.providers.len(), 1);
    assert!(report.providers[0].available);
}

#[tokio::test]
async fn purge_session_lifecycle() {
    let d = dispatch().await;
    let id = session_uuid(1);
    d.start_session(&ctx(), start_req(&id, "projA")).await.unwrap();

    assert_eq!(
        d.purge_session(&ctx(), &id).await.err().unwrap().kind,
        ErrorKind::InvalidArgument
    );
    d.stop_session(&ctx(), &id, false).await.unwrap();
    d.purge_session(&ctx(), &id).await.unwrap();
    assert_eq!(d.get_session(&ctx(), &id).await.err().unwrap().kind, ErrorKind::NotFound);
}
