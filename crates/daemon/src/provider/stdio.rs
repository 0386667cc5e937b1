// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared runtime for piped-stdio adapters (line-oriented and JSON-lines).
//!
//! One supervising task per session owns the child: it serializes input
//! writes, watches for exit, and runs the termination ladder on stop.
//! Stdout/stderr readers are drained to end-of-stream before the terminal
//! event is emitted so no buffered output is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::spawn::{terminate, ExitOutcome};
use super::{ChannelSink, SessionHandle, SessionSpec};
use crate::event::{EventKind, SessionEvent, StreamTag};

/// Buffer sizes for the adapter-side channels.
const EVENT_BUFFER: usize = 256;
const INPUT_BUFFER: usize = 64;

/// How long to wait for the child after SIGKILL.
pub(crate) const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Translates between wire text and session events for one adapter mode.
pub(crate) trait Codec: Send + Sync + 'static {
    /// Encode one input payload for the child's stdin.
    fn encode_input(&self, text: &str) -> String;

    /// Decode one stdout line into an event, or `None` to suppress it.
    fn decode_stdout(&self, line: &str) -> Option<SessionEvent>;

    /// Decode one stderr line. Non-blank lines become stderr events.
    fn decode_stderr(&self, line: &str) -> Option<SessionEvent> {
        if line.trim().is_empty() {
            None
        } else {
            Some(SessionEvent::new(EventKind::Stderr, StreamTag::Stderr, line))
        }
    }

    /// Whether the adapter signals readiness right after spawn.
    fn ready_on_start(&self) -> bool {
        false
    }
}

/// Wire a freshly spawned child into a [`SessionHandle`] using `codec`.
///
/// The spawn-to-first-byte budget is enforced here: a child that never
/// produces a decodable stdout line within `startup_timeout` is killed and
/// the session fails.
pub(crate) fn launch<C: Codec>(
    mut child: Child,
    session: SessionSpec,
    startup_timeout: Duration,
    stop_grace: Duration,
    codec: C,
) -> SessionHandle {
    let codec = Arc::new(codec);
    let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
    let (input_tx, mut input_rx) = mpsc::channel::<String>(INPUT_BUFFER);
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
        let ids = session.clone();
        let stamp = move |ev: SessionEvent| {
            ev.with_ids(&ids.session_id, &ids.project_id, &ids.provider_id)
        };

        let _ = event_tx
            .send(stamp(SessionEvent::new(
                EventKind::SessionStarted,
                StreamTag::System,
                "session started",
            )))
            .await;
        if codec.ready_on_start() {
            let _ = event_tx
                .send(stamp(SessionEvent::new(EventKind::AgentReady, StreamTag::System, "")))
                .await;
        }

        let mut stdin = child.stdin.take();
        let first_output = CancellationToken::new();
        let out_task = child.stdout.take().map(|stdout| {
            tokio::spawn(pump_stdout(
                stdout,
                Arc::clone(&codec),
                event_tx.clone(),
                session.clone(),
                first_output.clone(),
            ))
        });
        let err_task = child.stderr.take().map(|stderr| {
            tokio::spawn(pump_stderr(stderr, Arc::clone(&codec), event_tx.clone(), session.clone()))
        });

        let mut stopping = false;
        let mut startup_failed = false;
        let mut startup_checked = false;
        let startup_deadline = tokio::time::sleep(startup_timeout);
        tokio::pin!(startup_deadline);

        let outcome: ExitOutcome = loop {
            tokio::select! {
                maybe_text = input_rx.recv(), if !stopping => {
                    if let Some(text) = maybe_text {
                        if let Some(pipe) = stdin.as_mut() {
                            let encoded = codec.encode_input(&text);
                            if pipe.write_all(encoded.as_bytes()).await.is_err() {
                                debug!(session = %session.session_id, "stdin write failed");
                            }
                            let _ = pipe.flush().await;
                        }
                    }
                }
                _ = stop.cancelled(), if !stopping => {
                    stopping = true;
                    // Close input before signalling so line-oriented children
                    // see EOF first.
                    drop(stdin.take());
                    let grace = if kill.is_cancelled() { Duration::ZERO } else { stop_grace };
                    break terminate(&mut child, grace, KILL_SETTLE).await;
                }
                _ = &mut startup_deadline, if !startup_checked && !stopping => {
                    startup_checked = true;
                    // The reader task cancels `first_output` without waking
                    // this loop, so the state is checked at the deadline
                    // rather than in the arm's guard.
                    if !first_output.is_cancelled() {
                        startup_failed = true;
                        break terminate(&mut child, Duration::ZERO, KILL_SETTLE).await;
                    }
                }
                status = child.wait() => {
                    break match status {
                        Ok(status) => {
                            use std::os::unix::process::ExitStatusExt;
                            ExitOutcome {
                                code: status.code(),
                                signal: status.signal(),
                                forced: false,
                            }
                        }
                        Err(_) => ExitOutcome { code: None, signal: None, forced: false },
                    };
                }
            }
        };

        // Drain readers to EOF before the terminal event.
        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }

        // A stop that raced the child's own exit still counts as a stop.
        let terminal = if stopping || stop.is_cancelled() {
            SessionEvent::new(EventKind::SessionStopped, StreamTag::System, "session stopped")
                .with_done()
        } else if startup_failed {
            SessionEvent::new(EventKind::SessionFailed, StreamTag::System, "session failed")
                .with_done()
                .with_error("startup timed out waiting for output")
        } else if outcome.clean() {
            SessionEvent::new(EventKind::SessionStopped, StreamTag::System, "session stopped")
                .with_done()
        } else {
            SessionEvent::new(EventKind::SessionFailed, StreamTag::System, "session failed")
                .with_done()
                .with_error(outcome.describe())
        };
        let _ = event_tx.send(stamp(terminal)).await;
        drop(event_tx);
        // Close the input channel before signalling done so a send racing
        // the stop observes a closed session.
        drop(input_rx);
        done.cancel();
    });

    handle
}

async fn pump_stdout<C: Codec>(
    stdout: ChildStdout,
    codec: Arc<C>,
    tx: mpsc::Sender<SessionEvent>,
    session: SessionSpec,
    first_output: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(ev) = codec.decode_stdout(&line) {
            first_output.cancel();
            let ev = ev.with_ids(&session.session_id, &session.project_id, &session.provider_id);
            if tx.send(ev).await.is_err() {
                return;
            }
        }
    }
}

async fn pump_stderr<C: Codec>(
    stderr: ChildStderr,
    codec: Arc<C>,
    tx: mpsc::Sender<SessionEvent>,
    session: SessionSpec,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(ev) = codec.decode_stderr(&line) {
            let ev = ev.with_ids(&session.session_id, &session.project_id, &session.provider_id);
            if tx.send(ev).await.is_err() {
                return;
            }
        }
    }
}
