// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The nine-operation facade between transports and the supervisor.
//!
//! Validates every request field, enforces the caller's project scope, and
//! maps internal failures onto the stable error taxonomy. Transports hand
//! in a [`RequestContext`] with claims already verified by the auth layer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, StreamTag};
use crate::provider::{ProviderHealth, SessionSpec};
use crate::session::SessionRecord;
use crate::supervisor::Supervisor;

pub const MAX_PROJECT_ID_LEN: usize = 128;
pub const MAX_SESSION_ID_LEN: usize = 64;
pub const MAX_REPO_PATH_LEN: usize = 4096;
pub const MAX_PROVIDER_ID_LEN: usize = 64;
pub const MAX_OPT_KEY_LEN: usize = 128;
pub const MAX_OPT_VALUE_LEN: usize = 4096;
/// Hard cap on input text regardless of policy.
pub const MAX_INPUT_HARD_CAP: usize = 1024 * 1024;

/// Decoded bearer-token claims, verified by a transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (caller identity).
    pub sub: String,
    /// Project scope; `None` grants access to every project.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub exp: u64,
}

/// Per-request context assembled by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Peer identity established by mutual TLS (subject common name).
    pub peer: Option<String>,
    pub claims: Option<Claims>,
}

impl RequestContext {
    pub fn authenticated(claims: Claims) -> Self {
        Self { peer: None, claims: Some(claims) }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub project_id: String,
    pub session_id: String,
    pub repo_path: String,
    pub provider_id: String,
    pub agent_opts: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StreamEventsRequest {
    pub session_id: String,
    pub subscriber_id: Option<String>,
    pub after_seq: u64,
}

/// Daemon health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub providers: Vec<ProviderHealth>,
}

/// Facade over the supervisor; one per daemon.
pub struct Dispatch {
    supervisor: Arc<Supervisor>,
    started_at: Instant,
}

impl Dispatch {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor, started_at: Instant::now() }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn start_session(
        &self,
        ctx: &RequestContext,
        req: StartSessionRequest,
    ) -> Result<SessionRecord, BrokerError> {
        let claims = require_claims(ctx)?;
        let session_id = parse_session_id(&req.session_id)?;
        validate_field("projectId", &req.project_id, MAX_PROJECT_ID_LEN, false)?;
        validate_field("repoPath", &req.repo_path, MAX_REPO_PATH_LEN, false)?;
        validate_field("providerId", &req.provider_id, MAX_PROVIDER_ID_LEN, false)?;
        if req.project_id.is_empty() {
            return Err(BrokerError::invalid_argument("projectId is required"));
        }
        if req.repo_path.is_empty() {
            return Err(BrokerError::invalid_argument("repoPath is required"));
        }
        if req.provider_id.is_empty() {
            return Err(BrokerError::invalid_argument("providerId is required"));
        }
        for (key, value) in &req.agent_opts {
            validate_field("agent option key", key, MAX_OPT_KEY_LEN, false)?;
            validate_field("agent option value", value, MAX_OPT_VALUE_LEN, true)?;
        }
        check_scope(claims, &req.project_id)?;

        self.supervisor
            .start_session(SessionSpec {
                session_id,
                project_id: req.project_id,
                provider_id: req.provider_id,
                repo_path: PathBuf::from(req.repo_path),
                agent_opts: req.agent_opts,
            })
            .await
    }

    pub async fn stop_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        force: bool,
    ) -> Result<SessionRecord, BrokerError> {
        let claims = require_claims(ctx)?;
        let session_id = parse_session_id(session_id)?;
        self.check_session_scope(claims, &session_id).await?;
        self.supervisor.stop_session(&session_id, force).await
    }

    pub async fn get_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> Result<SessionRecord, BrokerError> {
        let claims = require_claims(ctx)?;
        let session_id = parse_session_id(session_id)?;
        let record = self.supervisor.get_session(&session_id).await?;
        check_scope(claims, &record.project_id)?;
        Ok(record)
    }

    pub async fn list_sessions(
        &self,
        ctx: &RequestContext,
        project_id: Option<&str>,
    ) -> Result<Vec<SessionRecord>, BrokerError> {
        let claims = require_claims(ctx)?;
        if let Some(project) = project_id {
            validate_field("projectId", project, MAX_PROJECT_ID_LEN, false)?;
        }
        let effective = match (&claims.project, project_id) {
            (Some(scope), Some(requested)) => {
                if scope != requested {
                    return Err(BrokerError::permission_denied(format!(
                        "token scope is limited to project {scope}"
                    )));
                }
                Some(requested)
            }
            (Some(scope), None) => Some(scope.as_str()),
            (None, requested) => requested,
        };
        Ok(self.supervisor.list_sessions(effective).await)
    }

    pub async fn send_input(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        text: &str,
    ) -> Result<u64, BrokerError> {
        let claims = require_claims(ctx)?;
        let session_id = parse_session_id(session_id)?;
        if text.len() > MAX_INPUT_HARD_CAP {
            return Err(BrokerError::invalid_argument(format!(
                "input exceeds hard cap of {MAX_INPUT_HARD_CAP} bytes"
            )));
        }
        validate_field("input text", text, MAX_INPUT_HARD_CAP, true)?;
        self.check_session_scope(claims, &session_id).await?;
        self.supervisor.send_input(&session_id, text).await
    }

    pub async fn purge_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> Result<(), BrokerError> {
        let claims = require_claims(ctx)?;
        let session_id = parse_session_id(session_id)?;
        self.check_session_scope(claims, &session_id).await?;
        self.supervisor.purge_session(&session_id).await
    }

    /// Stream one session's events into `tx`: optional overflow marker,
    /// replay in ascending seq, then the live feed with duplicate
    /// suppression. Each delivered event is acknowledged so the
    /// subscriber's cursor survives a reconnect.
    pub async fn stream_events(
        &self,
        ctx: &RequestContext,
        req: StreamEventsRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<SessionEvent>,
    ) -> Result<(), BrokerError> {
        let claims = require_claims(ctx)?;
        let session_id = parse_session_id(&req.session_id)?;
        if let Some(ref sub) = req.subscriber_id {
            validate_field("subscriberId", sub, MAX_PROJECT_ID_LEN, false)?;
        }
        self.check_session_scope(claims, &session_id).await?;

        let entry = self.supervisor.entry(&session_id).await?;
        let mut attachment =
            entry.subscribers.attach(req.subscriber_id.as_deref(), req.after_seq)?;
        let subscriber_id = attachment.subscriber_id.clone();
        debug!(session = %session_id, subscriber = %subscriber_id, "stream attached");

        let detach = |reason: &str| {
            entry.subscribers.detach(attachment.listener_id);
            debug!(session = %session_id, subscriber = %subscriber_id, reason, "stream detached");
        };

        if attachment.overflow {
            let record = entry.snapshot();
            let marker = SessionEvent::new(
                EventKind::BufferOverflow,
                StreamTag::System,
                "events dropped before oldest retained sequence",
            )
            .with_ids(&record.session_id, &record.project_id, &record.provider_id);
            if tx.send(marker).await.is_err() {
                detach("consumer gone");
                return Ok(());
            }
        }

        let mut last_delivered = 0u64;
        let mut finished = false;
        for event in std::mem::take(&mut attachment.replay) {
            let seq = event.seq;
            let done = event.done;
            if tx.send(event).await.is_err() {
                detach("consumer gone");
                return Ok(());
            }
            entry.subscribers.ack(&subscriber_id, seq);
            last_delivered = seq;
            if done {
                finished = true;
                break;
            }
        }

        while !finished {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = attachment.live.recv() => {
                    let Some(event) = maybe else { break };
                    if event.seq <= last_delivered {
                        continue;
                    }
                    let seq = event.seq;
                    let done = event.done;
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    entry.subscribers.ack(&subscriber_id, seq);
                    last_delivered = seq;
                    if done {
                        finished = true;
                    }
                }
            }
        }

        detach(if finished { "stream complete" } else { "cancelled" });
        Ok(())
    }

    /// Never fails and skips the token check.
    pub async fn health(&self) -> HealthReport {
        let providers = self.supervisor.registry().probe_all().await;
        let (active, _) = self.supervisor.session_counts().await;
        let status = if providers.iter().all(|p| p.available) { "ok" } else { "degraded" };
        HealthReport {
            status: status.to_owned(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_sessions: active,
            providers,
        }
    }

    pub async fn list_providers(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<ProviderHealth>, BrokerError> {
        require_claims(ctx)?;
        Ok(self.supervisor.registry().probe_all().await)
    }

    async fn check_session_scope(
        &self,
        claims: &Claims,
        session_id: &str,
    ) -> Result<(), BrokerError> {
        if claims.project.is_none() {
            return Ok(());
        }
        let record = self.supervisor.get_session(session_id).await?;
        check_scope(claims, &record.project_id)
    }
}

fn require_claims(ctx: &RequestContext) -> Result<&Claims, BrokerError> {
    ctx.claims
        .as_ref()
        .ok_or_else(|| BrokerError::unauthenticated("missing or invalid bearer token"))
}

fn check_scope(claims: &Claims, project_id: &str) -> Result<(), BrokerError> {
    match &claims.project {
        Some(scope) if scope != project_id => Err(BrokerError::permission_denied(format!(
            "token scope is limited to project {scope}"
        ))),
        _ => Ok(()),
    }
}

/// Canonicalize a session identifier: must parse as a UUID.
fn parse_session_id(raw: &str) -> Result<String, BrokerError> {
    validate_field("sessionId", raw, MAX_SESSION_ID_LEN, false)?;
    let uuid = Uuid::parse_str(raw)
        .map_err(|_| BrokerError::invalid_argument(format!("sessionId {raw:?} is not a UUID")))?;
    Ok(uuid.to_string())
}

/// Reject oversize fields and disallowed control characters.
fn validate_field(
    name: &str,
    value: &str,
    max_len: usize,
    allow_whitespace_controls: bool,
) -> Result<(), BrokerError> {
    if value.len() > max_len {
        return Err(BrokerError::invalid_argument(format!(
            "{name} exceeds {max_len} bytes"
        )));
    }
    let disallowed = value.chars().any(|c| {
        c.is_control()
            && !(allow_whitespace_controls && matches!(c, '\t' | '\r' | '\n'))
    });
    if disallowed {
        return Err(BrokerError::invalid_argument(format!(
            "{name} contains control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
