// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pseudo-terminal adapter for agents that only speak interactively.
//!
//! The child runs on a PTY spawned via `forkpty`. A configured regular
//! expression detects the interactive prompt: the first match signals
//! readiness, each later match after intervening output marks the end of a
//! response. Prompt lines themselves are suppressed from the output stream.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvpe, Pid};
use regex::Regex;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, StreamTag};

use super::spawn::{binary_available, filtered_env, ExitOutcome};
use super::{ChannelSink, Provider, ProviderSpec, SessionHandle, SessionSpec};

const PTY_COLS: u16 = 200;
const PTY_ROWS: u16 = 50;

/// Newtype wrapper around `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
struct PtyFd(OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl std::os::fd::AsFd for PtyFd {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.0.as_fd()
    }
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn set_nonblocking(fd: &impl std::os::fd::AsFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

async fn read_chunk(afd: &AsyncFd<PtyFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| {
            let n = nix::unistd::read(inner, buf).map_err(io_err)?;
            Ok(n)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_all(afd: &AsyncFd<PtyFd>, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| {
            let n = nix::unistd::write(inner, &data[offset..]).map_err(io_err)?;
            Ok(n)
        }) {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Spawn a child on a new PTY with the filtered environment.
// forkpty requires unsafe: post-fork child is partially initialized
#[allow(unsafe_code)]
fn spawn_pty(
    binary: &str,
    args: &[String],
    cwd: &Path,
) -> Result<(AsyncFd<PtyFd>, Pid), BrokerError> {
    let winsize =
        Winsize { ws_col: PTY_COLS, ws_row: PTY_ROWS, ws_xpixel: 0, ws_ypixel: 0 };

    // Argument and environment vectors are prepared before forking; the
    // child only chdirs and execs.
    let mut c_args: Vec<CString> = Vec::with_capacity(args.len() + 1);
    for part in std::iter::once(binary).chain(args.iter().map(String::as_str)) {
        c_args.push(
            CString::new(part.as_bytes())
                .map_err(|_| BrokerError::invalid_argument("NUL byte in command argument"))?,
        );
    }
    let mut c_env: Vec<CString> = Vec::new();
    for (name, value) in filtered_env() {
        if let Ok(entry) = CString::new(format!("{name}={value}")) {
            c_env.push(entry);
        }
    }
    if let Ok(term) = CString::new("TERM=xterm-256color") {
        c_env.push(term);
    }

    // SAFETY: forkpty is unsafe because the child is in a
    // partially-initialized state after fork. We immediately exec.
    let result = unsafe { forkpty(&winsize, None) }
        .map_err(|e| BrokerError::unavailable(format!("forkpty failed: {e}")))?;

    match result {
        ForkptyResult::Child => {
            let _ = nix::unistd::chdir(cwd);
            let _ = execvpe(&c_args[0], &c_args, &c_env);
            std::process::exit(127);
        }
        ForkptyResult::Parent { child, master } => {
            set_nonblocking(&master)
                .map_err(|e| BrokerError::unavailable(format!("pty setup: {e}")))?;
            let afd = AsyncFd::new(PtyFd(master))
                .map_err(|e| BrokerError::unavailable(format!("pty setup: {e}")))?;
            Ok((afd, child))
        }
    }
}

/// Block until the child exits and describe the outcome.
fn wait_for_exit(pid: Pid) -> ExitOutcome {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return ExitOutcome { code: Some(code), signal: None, forced: false };
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return ExitOutcome { code: None, signal: Some(sig as i32), forced: false };
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return ExitOutcome { code: None, signal: None, forced: false },
        }
    }
}

/// What one chunk of PTY output produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PtyAction {
    Line(String),
    Ready,
    Complete,
}

/// Incremental prompt detector over the PTY byte stream.
///
/// Prompts usually arrive without a trailing newline, so the pending
/// partial line is also tested after every chunk.
pub(crate) struct PromptScanner {
    prompt: Regex,
    ansi: Regex,
    partial: String,
    seen_first: bool,
    output_since_match: bool,
}

impl PromptScanner {
    pub(crate) fn new(prompt: Regex) -> Self {
        Self {
            prompt,
            ansi: ansi_pattern(),
            partial: String::new(),
            seen_first: false,
            output_since_match: false,
        }
    }

    pub(crate) fn seen_first(&self) -> bool {
        self.seen_first
    }

    fn clean(&self, line: &str) -> String {
        self.ansi.replace_all(line, "").trim_end_matches('\r').to_owned()
    }

    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<PtyAction> {
        let mut actions = Vec::new();
        for ch in chunk.chars() {
            if ch == '\n' {
                let raw = std::mem::take(&mut self.partial);
                let line = self.clean(&raw);
                if self.prompt.is_match(&line) {
                    self.mark_prompt(&mut actions);
                } else if !line.trim().is_empty() {
                    self.output_since_match = true;
                    actions.push(PtyAction::Line(line));
                }
            } else {
                self.partial.push(ch);
            }
        }

        let pending = self.clean(&self.partial);
        if self.prompt.is_match(&pending) {
            self.partial.clear();
            self.mark_prompt(&mut actions);
        }
        actions
    }

    fn mark_prompt(&mut self, actions: &mut Vec<PtyAction>) {
        if !self.seen_first {
            self.seen_first = true;
            actions.push(PtyAction::Ready);
        } else if self.output_since_match {
            self.output_since_match = false;
            actions.push(PtyAction::Complete);
        }
    }
}

/// CSI and OSC escape sequences; enough to match prompts rendered with
/// colors.
fn ansi_pattern() -> Regex {
    // Known-good literal pattern.
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").unwrap()
}

pub struct PtyProvider {
    spec: ProviderSpec,
    prompt: Regex,
}

impl PtyProvider {
    pub fn new(spec: ProviderSpec, prompt_pattern: &str) -> Result<Self, BrokerError> {
        let prompt = Regex::new(prompt_pattern).map_err(|e| {
            BrokerError::invalid_argument(format!("prompt pattern for {}: {e}", spec.id))
        })?;
        Ok(Self { spec, prompt })
    }
}

impl Provider for PtyProvider {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn mode(&self) -> &'static str {
        "pty"
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
        Box::pin(async move {
            let (master, pid) = spawn_pty(&self.spec.binary, &self.spec.args, &session.repo_path)?;
            Ok(run_pty_session(
                master,
                pid,
                session,
                self.prompt.clone(),
                self.spec.startup_timeout(),
                self.spec.stop_grace(),
            ))
        })
    }
}

fn run_pty_session(
    master: AsyncFd<PtyFd>,
    pid: Pid,
    session: SessionSpec,
    prompt: Regex,
    startup_timeout: Duration,
    stop_grace: Duration,
) -> SessionHandle {
    let (event_tx, events) = mpsc::channel(256);
    let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
    let stop = CancellationToken::new();
    let kill_token = CancellationToken::new();
    let done = CancellationToken::new();

    let handle = SessionHandle {
        events,
        input: Box::new(ChannelSink::new(input_tx)),
        stop: stop.clone(),
        kill: kill_token.clone(),
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

        let mut scanner = PromptScanner::new(prompt);
        let mut buf = vec![0u8; 8192];
        let mut stopping = false;
        let mut startup_failed = false;
        let mut grace_deadline: Option<Pin<Box<tokio::time::Sleep>>> = None;
        let startup_deadline = tokio::time::sleep(startup_timeout);
        tokio::pin!(startup_deadline);

        loop {
            tokio::select! {
                result = read_chunk(&master, &mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                            for action in scanner.feed(&chunk) {
                                let ev = match action {
                                    PtyAction::Line(text) => SessionEvent::new(
                                        EventKind::Stdout, StreamTag::Stdout, text),
                                    PtyAction::Ready => SessionEvent::new(
                                        EventKind::AgentReady, StreamTag::System, ""),
                                    PtyAction::Complete => SessionEvent::new(
                                        EventKind::ResponseComplete, StreamTag::System, ""),
                                };
                                if event_tx.send(stamp(ev)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(_) => break,
                    }
                }
                maybe_text = input_rx.recv(), if !stopping => {
                    if let Some(text) = maybe_text {
                        let mut data = text.into_bytes();
                        if data.last() != Some(&b'\n') {
                            data.push(b'\n');
                        }
                        if write_all(&master, &data).await.is_err() {
                            debug!(session = %session.session_id, "pty write failed");
                        }
                    }
                }
                _ = stop.cancelled(), if !stopping => {
                    stopping = true;
                    if kill_token.is_cancelled() {
                        let _ = kill(pid, Signal::SIGKILL);
                    } else {
                        let _ = kill(pid, Signal::SIGTERM);
                        grace_deadline = Some(Box::pin(tokio::time::sleep(stop_grace)));
                    }
                }
                _ = async {
                    match grace_deadline.as_mut() {
                        Some(deadline) => deadline.await,
                        None => std::future::pending().await,
                    }
                } => {
                    grace_deadline = None;
                    let _ = kill(pid, Signal::SIGKILL);
                }
                _ = &mut startup_deadline, if !scanner.seen_first() && !stopping && !startup_failed => {
                    startup_failed = true;
                    let _ = kill(pid, Signal::SIGKILL);
                    // Keep draining until EOF; terminal emitted below.
                }
            }
        }

        let reaped =
            tokio::task::spawn_blocking(move || wait_for_exit(pid)).await.unwrap_or(ExitOutcome {
                code: None,
                signal: None,
                forced: true,
            });

        // A stop that raced the child's own exit still counts as a stop.
        let terminal = if stopping || stop.is_cancelled() {
            SessionEvent::new(EventKind::SessionStopped, StreamTag::System, "session stopped")
                .with_done()
        } else if startup_failed {
            SessionEvent::new(EventKind::SessionFailed, StreamTag::System, "session failed")
                .with_done()
                .with_error("startup timed out waiting for prompt")
        } else if reaped.clean() {
            SessionEvent::new(EventKind::SessionStopped, StreamTag::System, "session stopped")
                .with_done()
        } else {
            SessionEvent::new(EventKind::SessionFailed, StreamTag::System, "session failed")
                .with_done()
                .with_error(reaped.describe())
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

#[cfg(test)]
#[path = "pty_tests.rs"]
mod tests;
