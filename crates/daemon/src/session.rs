// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::event::{now_ms, SessionState};

/// State of one supervised session. Owned by the supervisor; snapshots are
/// handed out by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_id: String,
    pub provider_id: String,
    pub repo_path: PathBuf,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at_ms: Option<u64>,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        provider_id: impl Into<String>,
        repo_path: PathBuf,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            provider_id: provider_id.into(),
            repo_path,
            created_at_ms: now_ms(),
            stopped_at_ms: None,
            state: SessionState::Starting,
            last_error: None,
        }
    }

    /// Transition into a terminal state; no-op when already terminal.
    pub fn mark_terminal(&mut self, failed: bool, error: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if failed { SessionState::Failed } else { SessionState::Stopped };
        self.stopped_at_ms = Some(now_ms());
        if failed {
            self.last_error = error;
        }
    }
}
