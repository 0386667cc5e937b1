// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider adapters: each knows how to spawn and converse with one kind of
//! command-line coding agent, translating its byte streams into typed
//! session events.

pub mod json_lines;
pub mod line_stdio;
pub mod one_shot;
pub mod pty;
pub mod registry;
pub mod spawn;
pub(crate) mod stdio;

pub use registry::{ProviderHealth, ProviderRegistry};

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::event::SessionEvent;

/// How an adapter talks to its subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProviderMode {
    /// Line-oriented stdout/stderr; each non-blank line is one event.
    LineStdio,
    /// One JSON object per line on stdin and stdout.
    JsonLines,
    /// Pseudo-terminal with regex prompt detection.
    Pty { prompt_pattern: String },
    /// A fresh subprocess per input, resuming a conversation thread.
    OneShotExec {
        #[serde(default)]
        exec_flags: Vec<String>,
    },
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LineStdio => "line_stdio",
            Self::JsonLines => "json_lines",
            Self::Pty { .. } => "pty",
            Self::OneShotExec { .. } => "one_shot_exec",
        }
    }
}

/// One provider entry from the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Registry identifier (e.g. "claude", "codex").
    pub id: String,
    /// Binary name or absolute path.
    pub binary: String,
    /// Default argument list.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(flatten)]
    pub mode: ProviderMode,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Environment variables that must be set for the daemon to start.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl ProviderSpec {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Per-session parameters handed to an adapter's `start`.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: String,
    pub project_id: String,
    pub provider_id: String,
    pub repo_path: PathBuf,
    pub agent_opts: HashMap<String, String>,
}

/// Where input text enters an adapter.
///
/// Channel-backed adapters serialize concurrent sends through the channel;
/// the one-shot adapter rejects concurrent sends as busy.
pub trait InputSink: Send + Sync {
    fn send(
        &self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// A live session owned by an adapter.
///
/// `events` is a finite stream: exactly one terminal event (done flag set)
/// is emitted, after which the channel closes. `stop` requests graceful
/// termination, `kill` skips the grace period, and `done` resolves once the
/// subprocess has been reaped and the terminal event emitted.
pub struct SessionHandle {
    pub events: mpsc::Receiver<SessionEvent>,
    pub input: Box<dyn InputSink>,
    pub stop: CancellationToken,
    pub kill: CancellationToken,
    pub done: CancellationToken,
}

impl SessionHandle {
    /// Request termination and wait until the adapter has fully torn down.
    pub async fn stop(&self, force: bool) {
        if force {
            self.kill.cancel();
        }
        self.stop.cancel();
        self.done.cancelled().await;
    }
}

pub type StartFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SessionHandle, BrokerError>> + Send + 'a>>;

/// Capability set implemented by every adapter variant.
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn mode(&self) -> &'static str;

    fn version(&self) -> Option<&str>;

    /// Cheap liveness probe: the configured binary exists and is executable.
    fn health(&self) -> Result<(), BrokerError>;

    /// Spawn budget enforced by the supervisor around `start`.
    fn startup_timeout(&self) -> Duration {
        Duration::from_secs(default_startup_timeout_secs())
    }

    /// Spawn a subprocess for one session. A spawn failure surfaces as
    /// `Unavailable` and registers nothing.
    fn start(&self, spec: SessionSpec) -> StartFuture<'_>;
}

/// Build the adapter variant selected by a provider spec.
pub fn build_provider(spec: ProviderSpec) -> Result<std::sync::Arc<dyn Provider>, BrokerError> {
    use std::sync::Arc;

    match spec.mode.clone() {
        ProviderMode::LineStdio => Ok(Arc::new(line_stdio::LineStdioProvider::new(spec))),
        ProviderMode::JsonLines => Ok(Arc::new(json_lines::JsonLinesProvider::new(spec))),
        ProviderMode::Pty { prompt_pattern } => pty::PtyProvider::new(spec, &prompt_pattern)
            .map(|provider| Arc::new(provider) as Arc<dyn Provider>),
        ProviderMode::OneShotExec { exec_flags } => {
            Ok(Arc::new(one_shot::OneShotProvider::new(spec, exec_flags)))
        }
    }
}

/// Channel-backed input sink shared by the stdio and pty adapters.
pub(crate) struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub(crate) fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

impl InputSink for ChannelSink {
    fn send(
        &self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.tx
                .send(text)
                .await
                .map_err(|_| BrokerError::session_not_running("session input closed"))
        })
    }
}
