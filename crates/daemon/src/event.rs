// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle states and the event record broadcast to observers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    SessionStopped,
    SessionFailed,
    Stdout,
    Stderr,
    InputReceived,
    BufferOverflow,
    AgentReady,
    ResponseComplete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionStopped => "session_stopped",
            Self::SessionFailed => "session_failed",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::InputReceived => "input_received",
            Self::BufferOverflow => "buffer_overflow",
            Self::AgentReady => "agent_ready",
            Self::ResponseComplete => "response_complete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stream of the subprocess an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    System,
    Stdout,
    Stderr,
}

impl StreamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One unit of output or state change from a session.
///
/// Immutable once appended to the log; `seq` is assigned by the log at
/// append time and is 0 before that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub session_id: String,
    pub project_id: String,
    pub provider_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub stream: StreamTag,
    pub text: String,
    /// Set on the final event of a session's stream.
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionEvent {
    /// Build an unsequenced event stamped with the current wall clock.
    pub fn new(kind: EventKind, stream: StreamTag, text: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp_ms: now_ms(),
            session_id: String::new(),
            project_id: String::new(),
            provider_id: String::new(),
            kind,
            stream,
            text: text.into(),
            done: false,
            error: None,
        }
    }

    pub fn with_ids(
        mut self,
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        self.session_id = session_id.into();
        self.project_id = project_id.into();
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Stopping.is_terminal());
    }

    #[test]
    fn event_serde_wire_form() {
        let ev = SessionEvent::new(EventKind::Stdout, StreamTag::Stdout, "hi")
            .with_ids("s", "p", "claude");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"stdout\""));
        assert!(json.contains("\"stream\":\"stdout\""));
        // No error field when absent.
        assert!(!json.contains("\"error\""));

        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn builder_sets_terminal_fields() {
        let ev = SessionEvent::new(EventKind::SessionFailed, StreamTag::System, "")
            .with_done()
            .with_error("exit status 2");
        assert!(ev.done);
        assert_eq!(ev.error.as_deref(), Some("exit status 2"));
    }
}
