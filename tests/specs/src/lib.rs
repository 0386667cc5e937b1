// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end harness: a dispatch facade wired to real subprocess-backed
//! providers (`cat` for echo, `sh` scripts for JSON-lines agents), driven
//! the way a transport would drive it.

// Test harness: failing loudly beats propagating errors.
#![allow(clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aviary::config::SessionPolicy;
use aviary::dispatch::{
    Claims, Dispatch, RequestContext, StartSessionRequest, StreamEventsRequest,
};
use aviary::event::SessionEvent;
use aviary::provider::{build_provider, ProviderMode, ProviderRegistry, ProviderSpec};
use aviary::redact::default_redactor;
use aviary::supervisor::Supervisor;

/// A dispatch facade plus the scratch repo directory sessions run in.
pub struct TestBroker {
    pub dispatch: Arc<Dispatch>,
    pub repo_dir: tempfile::TempDir,
}

impl TestBroker {
    pub fn repo_path(&self) -> String {
        self.repo_dir.path().display().to_string()
    }
}

/// Provider entries available to every test broker.
fn provider_specs() -> Vec<ProviderSpec> {
    vec![
        // Echo agent: cat writes stdin lines straight back.
        ProviderSpec {
            id: "echo".to_owned(),
            binary: "cat".to_owned(),
            args: vec![],
            mode: ProviderMode::LineStdio,
            startup_timeout_secs: 10,
            stop_grace_secs: 2,
            required_env: vec![],
            version: Some("1.0".to_owned()),
        },
        // JSON-lines agent: answers every stdin line with an assistant
        // message and a turn result.
        ProviderSpec {
            id: "scripted".to_owned(),
            binary: "sh".to_owned(),
            args: vec![
                "-c".to_owned(),
                concat!(
                    r#"while IFS= read -r line; do "#,
                    r#"printf '{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}\n'; "#,
                    r#"printf '{"type":"result","result":"done"}\n'; "#,
                    r#"done"#,
                )
                .to_owned(),
            ],
            mode: ProviderMode::JsonLines,
            startup_timeout_secs: 10,
            stop_grace_secs: 2,
            required_env: vec![],
            version: None,
        },
    ]
}

/// Build a broker whose policy admits the scratch repo directory.
pub async fn broker() -> TestBroker {
    broker_with(|_| {}).await
}

/// Build a broker with policy tweaks applied on top of the defaults.
pub async fn broker_with(tweak: impl FnOnce(&mut SessionPolicy)) -> TestBroker {
    let repo_dir = tempfile::tempdir().expect("tempdir");
    let mut policy = SessionPolicy {
        allowed_repo_paths: vec![repo_dir.path().display().to_string()],
        ..SessionPolicy::default()
    };
    tweak(&mut policy);

    let registry = Arc::new(ProviderRegistry::new());
    for spec in provider_specs() {
        let provider = build_provider(spec).expect("provider spec");
        registry.register(provider).await.expect("register");
    }

    let supervisor = Arc::new(Supervisor::new(registry, policy, default_redactor()));
    TestBroker { dispatch: Arc::new(Dispatch::new(supervisor)), repo_dir }
}

/// Context carrying claims without a project scope.
pub fn admin_ctx() -> RequestContext {
    RequestContext::authenticated(Claims {
        sub: "specs".to_owned(),
        project: None,
        aud: Some("aviary".to_owned()),
        iat: 0,
        exp: u64::MAX,
    })
}

/// Context scoped to one project.
pub fn scoped_ctx(project: &str) -> RequestContext {
    let mut ctx = admin_ctx();
    if let Some(claims) = ctx.claims.as_mut() {
        claims.project = Some(project.to_owned());
    }
    ctx
}

/// Deterministic UUID for scenario `n`.
pub fn uuid(n: u8) -> String {
    format!("00000000-0000-4000-8000-00000000ff{n:02x}")
}

/// Start request against the broker's scratch repo.
pub fn start_request(broker: &TestBroker, session_id: &str, project: &str) -> StartSessionRequest {
    start_request_for(broker, session_id, project, "echo")
}

pub fn start_request_for(
    broker: &TestBroker,
    session_id: &str,
    project: &str,
    provider: &str,
) -> StartSessionRequest {
    StartSessionRequest {
        project_id: project.to_owned(),
        session_id: session_id.to_owned(),
        repo_path: broker.repo_path(),
        provider_id: provider.to_owned(),
        agent_opts: HashMap::new(),
    }
}

/// Drive a stream until it stays idle for `idle`, then cancel and return
/// everything delivered.
pub async fn collect_stream(
    dispatch: &Dispatch,
    ctx: &RequestContext,
    req: StreamEventsRequest,
    idle: Duration,
) -> Vec<SessionEvent> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(256);
    let fut = dispatch.stream_events(ctx, req, cancel.clone(), tx);
    tokio::pin!(fut);

    let mut events = Vec::new();
    let mut stream_done = false;
    loop {
        tokio::select! {
            result = &mut fut, if !stream_done => {
                result.expect("stream failed");
                stream_done = true;
            }
            maybe = tokio::time::timeout(idle, rx.recv()) => {
                match maybe {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => break,
                    Err(_) => cancel.cancel(),
                }
            }
        }
    }
    events
}

/// Stream until `want` events with seq > 0 have arrived (or panic after
/// `deadline`), acking as it goes; returns them without cancelling early.
pub async fn stream_at_least(
    dispatch: &Dispatch,
    ctx: &RequestContext,
    req: StreamEventsRequest,
    want: usize,
    deadline: Duration,
) -> Vec<SessionEvent> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(256);
    let fut = dispatch.stream_events(ctx, req, cancel.clone(), tx);
    tokio::pin!(fut);

    let mut events = Vec::new();
    let mut stream_done = false;
    let hard_stop = tokio::time::Instant::now() + deadline;
    while events.len() < want {
        tokio::select! {
            result = &mut fut, if !stream_done => {
                result.expect("stream failed");
                stream_done = true;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(hard_stop) => {
                panic!("only {} of {want} events arrived", events.len());
            }
        }
    }
    cancel.cancel();
    // Let the stream loop observe the cancellation and detach.
    if !stream_done {
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut fut).await;
    }
    events
}
