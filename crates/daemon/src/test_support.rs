// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit and integration tests: an in-process echo
//! provider and claim/id builders.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Claims;
use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, StreamTag};
use crate::provider::{
    ChannelSink, Provider, ProviderRegistry, SessionHandle, SessionSpec, StartFuture,
};

/// In-process provider that echoes every input line back as stdout and
/// terminates cleanly on stop. No subprocess involved, so tests stay
/// deterministic.
pub struct EchoProvider {
    id: String,
    healthy: bool,
    start_delay: Duration,
}

impl EchoProvider {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_owned(), healthy: true, start_delay: Duration::ZERO }
    }

    pub fn unhealthy(id: &str) -> Self {
        Self { id: id.to_owned(), healthy: false, start_delay: Duration::ZERO }
    }

    /// Delay `start` to simulate a slow-spawning provider.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

impl Provider for EchoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn mode(&self) -> &'static str {
        "line_stdio"
    }

    fn version(&self) -> Option<&str> {
        Some("0.0.0-test")
    }

    fn health(&self) -> Result<(), BrokerError> {
        if self.healthy {
            Ok(())
        } else {
            Err(BrokerError::unavailable("binary missing"))
        }
    }

    fn start(&self, spec: SessionSpec) -> StartFuture<'_> {
        let start_delay = self.start_delay;
        Box::pin(async move {
            if !start_delay.is_zero() {
                tokio::time::sleep(start_delay).await;
            }
            let (event_tx, events) = mpsc::channel(64);
            let (input_tx, mut input_rx) = mpsc::channel::<String>(16);
            let stop = CancellationToken::new();
            let kill = CancellationToken::new();
            let done = CancellationToken::new();

            let handle = SessionHandle {
                events,
                input: Box::new(ChannelSink::new(input_tx)),
                stop: stop.clone(),
                kill: kill.clone(),
                done: done.clone(),
            };

            tokio::spawn(async move {
                let stamp = |ev: SessionEvent| {
                    ev.with_ids(&spec.session_id, &spec.project_id, &spec.provider_id)
                };
                let _ = event_tx
                    .send(stamp(SessionEvent::new(
                        EventKind::SessionStarted,
                        StreamTag::System,
                        "session started",
                    )))
                    .await;
                loop {
                    tokio::select! {
                        maybe = input_rx.recv() => {
                            if let Some(text) = maybe {
                                let _ = event_tx
                                    .send(stamp(SessionEvent::new(
                                        EventKind::Stdout,
                                        StreamTag::Stdout,
                                        text,
                                    )))
                                    .await;
                            }
                        }
                        _ = stop.cancelled() => break,
                    }
                }
                let _ = event_tx
                    .send(stamp(
                        SessionEvent::new(
                            EventKind::SessionStopped,
                            StreamTag::System,
                            "session stopped",
                        )
                        .with_done(),
                    ))
                    .await;
                drop(event_tx);
                drop(input_rx);
                done.cancel();
            });

            Ok(handle)
        })
    }
}

/// Registry with one healthy `echo` provider.
pub async fn echo_registry() -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    let _ = registry.register(Arc::new(EchoProvider::new("echo"))).await;
    registry
}

/// Claims with an optional project scope.
pub fn claims(project: Option<&str>) -> Claims {
    Claims {
        sub: "tester".to_owned(),
        project: project.map(str::to_owned),
        aud: Some("aviary".to_owned()),
        iat: 0,
        exp: u64::MAX,
    }
}

/// Deterministic session UUID for test number `n`.
pub fn session_uuid(n: u8) -> String {
    format!("00000000-0000-4000-8000-0000000000{n:02x}")
}
