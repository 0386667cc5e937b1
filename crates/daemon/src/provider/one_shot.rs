// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot exec adapter: no resident subprocess. Each input spawns a
//! fresh child in thread-resumption mode, its JSON-lines output becomes
//! events, and the turn ends with `response_complete` on exit. Only one
//! child may run at a time per session; a concurrent send is busy.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, StreamTag};

use super::json_lines::decode_stdout_line;
use super::spawn::{binary_available, spawn_child, terminate, wait_exit};
use super::stdio::KILL_SETTLE;
use super::{InputSink, Provider, ProviderSpec, SessionHandle, SessionSpec};

pub struct OneShotProvider {
    spec: ProviderSpec,
    exec_flags: Vec<String>,
}

impl OneShotProvider {
    pub fn new(spec: ProviderSpec, exec_flags: Vec<String>) -> Self {
        Self { spec, exec_flags }
    }
}

/// Input sink that admits one in-flight exec at a time.
struct OneShotSink {
    busy: Arc<AtomicBool>,
    tx: mpsc::Sender<String>,
}

impl InputSink for OneShotSink {
    fn send(
        &self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
            {
                return Err(BrokerError::resource_exhausted("provider busy"));
            }
            if self.tx.send(text).await.is_err() {
                self.busy.store(false, Ordering::Release);
                return Err(BrokerError::session_not_running("session input closed"));
            }
            Ok(())
        })
    }
}

impl Provider for OneShotProvider {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn mode(&self) -> &'static str {
        "one_shot_exec"
    }

    fn version(&self) -> Option<&str> {
        self.spec.version.as_deref()
    }

    fn health(&self) -> Result<(), BrokerError> {
        if binary_available(&self.spec.binary) {
            Ok(())
        } else {
            Err(BrokerError::unavailable(format!("binary {} not executable", self.spec.binary)))
        }
    }

    fn startup_timeout(&self) -> Duration {
        self.spec.startup_timeout()
    }

    fn start(&self, session: SessionSpec) -> super::StartFuture<'_> {
        let spec = self.spec.clone();
        let exec_flags = self.exec_flags.clone();
        Box::pin(async move {
            // Nothing to spawn yet, but a missing binary should fail the
            // session up front rather than on the first input.
            if !binary_available(&spec.binary) {
                return Err(BrokerError::unavailable(format!(
                    "binary {} not executable",
                    spec.binary
                )));
            }
            Ok(run_one_shot_session(spec, exec_flags, session))
        })
    }
}

fn run_one_shot_session(
    spec: ProviderSpec,
    exec_flags: Vec<String>,
    session: SessionSpec,
) -> SessionHandle {
    let (event_tx, events) = mpsc::channel(256);
    let (exec_tx, mut exec_rx) = mpsc::channel::<String>(1);
    let busy = Arc::new(AtomicBool::new(false));
    let stop = CancellationToken::new();
    let kill = CancellationToken::new();
    let done = CancellationToken::new();

    let handle = SessionHandle {
        events,
        input: Box::new(OneShotSink { busy: Arc::clone(&busy), tx: exec_tx }),
        stop: stop.clone(),
        kill: kill.clone(),
        done: done.clone(),
    };

    tokio::spawn(async move {
        let stamp = |ev: SessionEvent| {
            ev.with_ids(&session.session_id, &session.project_id, &session.provider_id)
        };
        let _ = event_tx
            .send(stamp(SessionEvent::new(
                EventKind::SessionStarted,
                StreamTag::System,
                "session started",
            )))
            .await;
        let _ = event_tx
            .send(stamp(SessionEvent::new(EventKind::AgentReady, StreamTag::System, "")))
            .await;

        loop {
            tokio::select! {
                maybe_text = exec_rx.recv() => {
                    match maybe_text {
                        Some(text) => {
                            run_exec(&spec, &exec_flags, &session, &text, &event_tx, &stop).await;
                            busy.store(false, Ordering::Release);
                        }
                        None => break,
                    }
                }
                _ = stop.cancelled() => break,
            }
        }

        let _ = event_tx
            .send(stamp(
                SessionEvent::new(EventKind::SessionStopped, StreamTag::System, "session stopped")
                    .with_done(),
            ))
            .await;
        drop(event_tx);
        // Close the exec channel before signalling done so a send racing
        // the stop observes a closed session.
        drop(exec_rx);
        done.cancel();
    });

    handle
}

/// Run one exec turn: spawn, feed the prompt on stdin, stream JSON-lines
/// output as events, emit `response_complete` when the child exits.
async fn run_exec(
    spec: &ProviderSpec,
    exec_flags: &[String],
    session: &SessionSpec,
    text: &str,
    event_tx: &mpsc::Sender<SessionEvent>,
    stop: &CancellationToken,
) {
    let stamp = |ev: SessionEvent| {
        ev.with_ids(&session.session_id, &session.project_id, &session.provider_id)
    };

    let mut args: Vec<String> = exec_flags.to_vec();
    args.push("exec".to_owned());
    args.extend(spec.args.iter().cloned());
    args.push("--thread".to_owned());
    args.push(session.session_id.clone());

    let mut child = match spawn_child(&spec.binary, &args, &session.repo_path, &[]) {
        Ok(child) => child,
        Err(e) => {
            let _ = event_tx
                .send(stamp(SessionEvent::new(
                    EventKind::Stderr,
                    StreamTag::Stderr,
                    format!("spawn {}: {e}", spec.binary),
                )))
                .await;
            let _ = event_tx
                .send(stamp(SessionEvent::new(
                    EventKind::ResponseComplete,
                    StreamTag::System,
                    "",
                )))
                .await;
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let mut payload = text.to_owned();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        let _ = stdin.write_all(payload.as_bytes()).await;
        // Closing stdin tells the child the prompt is complete.
    }

    let first_output = CancellationToken::new();
    let out_task = child.stdout.take().map(|stdout| {
        let tx = event_tx.clone();
        let ids = session.clone();
        let first_output = first_output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // End-of-turn is signalled by process exit, not by a
                // result object; result lines become plain output.
                let decoded = decode_stdout_line(&line).map(|ev| {
                    if ev.kind == EventKind::ResponseComplete {
                        SessionEvent::new(EventKind::Stdout, StreamTag::Stdout, ev.text)
                    } else {
                        ev
                    }
                });
                if let Some(ev) = decoded {
                    first_output.cancel();
                    let ev = ev.with_ids(&ids.session_id, &ids.project_id, &ids.provider_id);
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        })
    });
    let err_task = child.stderr.take().map(|stderr| {
        let tx = event_tx.clone();
        let ids = session.clone();
        let first_output = first_output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                first_output.cancel();
                let ev = SessionEvent::new(EventKind::Stderr, StreamTag::Stderr, line)
                    .with_ids(&ids.session_id, &ids.project_id, &ids.provider_id);
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        })
    });

    let mut timed_out = false;
    let outcome = tokio::select! {
        outcome = wait_exit(&mut child) => outcome,
        _ = stop.cancelled() => {
            debug!(session = %session.session_id, "stop during exec turn");
            terminate(&mut child, Duration::ZERO, KILL_SETTLE).await
        }
        // Spawn-to-first-byte bound for the exec turn. The state of
        // `first_output` is checked at the deadline, not when the select
        // starts.
        _ = async {
            tokio::time::sleep(spec.startup_timeout()).await;
            if first_output.is_cancelled() {
                std::future::pending::<()>().await;
            }
        } => {
            timed_out = true;
            terminate(&mut child, Duration::ZERO, KILL_SETTLE).await
        }
    };

    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }

    if timed_out {
        let _ = event_tx
            .send(stamp(SessionEvent::new(
                EventKind::Stderr,
                StreamTag::Stderr,
                "exec timed out waiting for output",
            )))
            .await;
    } else if !outcome.clean() && !stop.is_cancelled() {
        let _ = event_tx
            .send(stamp(SessionEvent::new(
                EventKind::Stderr,
                StreamTag::Stderr,
                outcome.describe(),
            )))
            .await;
    }
    let _ = event_tx
        .send(stamp(SessionEvent::new(EventKind::ResponseComplete, StreamTag::System, "")))
        .await;
}

#[cfg(test)]
#[path = "one_shot_tests.rs"]
mod tests;
