// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session supervisor: owns every session record, its event log and
//! subscriber manager, enforces the creation policy, and forwards adapter
//! events into the log.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionPolicy;
use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, SessionState, StreamTag};
use crate::event_log::EventLog;
use crate::provider::{InputSink, ProviderRegistry, SessionSpec};
use crate::redact::Redactor;
use crate::session::SessionRecord;
use crate::subscriber::SubscriberManager;

/// Adapter-side handles the supervisor keeps after start.
struct SessionControl {
    input: Box<dyn InputSink>,
    stop: CancellationToken,
    kill: CancellationToken,
    done: CancellationToken,
}

/// One live (or terminated but unpurged) session.
pub struct SessionEntry {
    pub record: parking_lot::Mutex<SessionRecord>,
    pub log: Arc<EventLog>,
    pub subscribers: Arc<SubscriberManager>,
    control: SessionControl,
    /// Cancelled by the forwarder once the adapter's stream is fully
    /// drained into the log (terminal event included).
    drained: CancellationToken,
}

impl SessionEntry {
    pub fn snapshot(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    fn is_terminal(&self) -> bool {
        self.record.lock().state.is_terminal()
    }
}

/// Supervisor over all sessions of the daemon.
pub struct Supervisor {
    registry: Arc<ProviderRegistry>,
    policy: SessionPolicy,
    redact: Redactor,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(registry: Arc<ProviderRegistry>, policy: SessionPolicy, redact: Redactor) -> Self {
        Self {
            registry,
            policy,
            redact,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Create and start a session.
    ///
    /// The slow step — the adapter spawn, bounded by the provider's
    /// startup timeout — runs before the sessions lock is taken so other
    /// sessions stay serviceable throughout; admission is decided again
    /// in the brief synchronous insert section.
    pub async fn start_session(&self, spec: SessionSpec) -> Result<SessionRecord, BrokerError> {
        if spec.session_id.is_empty() || spec.project_id.is_empty() {
            return Err(BrokerError::invalid_argument("session and project ids are required"));
        }
        if !spec.repo_path.is_absolute() {
            return Err(BrokerError::invalid_argument("repo path must be absolute"));
        }
        if !self.policy.path_allowed(&spec.repo_path) {
            return Err(BrokerError::permission_denied(format!(
                "repo path {} is not allowed",
                spec.repo_path.display()
            )));
        }

        // Fast-fail before spawning anything.
        self.check_admission(&*self.sessions.read().await, &spec)?;

        let provider = self.registry.lookup(&spec.provider_id).await?;
        provider.health()?;

        let mut record = SessionRecord::new(
            &spec.session_id,
            &spec.project_id,
            &spec.provider_id,
            spec.repo_path.clone(),
        );

        let handle =
            match tokio::time::timeout(provider.startup_timeout(), provider.start(spec.clone()))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(BrokerError::unavailable(format!(
                        "provider {} startup timed out",
                        spec.provider_id
                    )))
                }
            };
        record.state = SessionState::Running;

        let mut sessions = self.sessions.write().await;
        if let Err(e) = self.check_admission(&sessions, &spec) {
            drop(sessions);
            // Lost an admission race while the subprocess was starting;
            // reap it before surfacing the error.
            handle.stop(true).await;
            return Err(e);
        }

        let log = Arc::new(EventLog::new(self.policy.event_buffer));
        let subscribers = Arc::new(SubscriberManager::new(
            Arc::clone(&log),
            self.policy.subscriber_cap,
            self.policy.subscriber_ttl(),
        ));

        let crate::provider::SessionHandle { events, input, stop, kill, done } = handle;
        let entry = Arc::new(SessionEntry {
            record: parking_lot::Mutex::new(record.clone()),
            log,
            subscribers,
            control: SessionControl { input, stop, kill, done },
            drained: CancellationToken::new(),
        });
        sessions.insert(spec.session_id.clone(), Arc::clone(&entry));
        drop(sessions);

        info!(session = %spec.session_id, provider = %spec.provider_id, "session started");
        tokio::spawn(forward_events(entry, events, self.redact.clone()));

        Ok(record)
    }

    /// Uniqueness and capacity checks shared by the pre-spawn fast path
    /// and the post-spawn insert.
    fn check_admission(
        &self,
        sessions: &HashMap<String, Arc<SessionEntry>>,
        spec: &SessionSpec,
    ) -> Result<(), BrokerError> {
        if sessions.contains_key(&spec.session_id) {
            return Err(BrokerError::already_exists(format!(
                "session {} already exists",
                spec.session_id
            )));
        }

        let global = sessions.values().filter(|e| !e.is_terminal()).count();
        if global >= self.policy.max_sessions_global {
            return Err(BrokerError::resource_exhausted(format!(
                "global session limit {} reached",
                self.policy.max_sessions_global
            )));
        }
        let in_project = sessions
            .values()
            .filter(|e| !e.is_terminal() && e.record.lock().project_id == spec.project_id)
            .count();
        if in_project >= self.policy.max_sessions_per_project {
            return Err(BrokerError::resource_exhausted(format!(
                "project session limit {} reached",
                self.policy.max_sessions_per_project
            )));
        }
        Ok(())
    }

    /// Feed one input payload to a running session. Returns the sequence
    /// of the recorded input event; output for this input has a greater
    /// sequence.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<u64, BrokerError> {
        let entry = self.entry(session_id).await?;
        if text.is_empty() {
            return Err(BrokerError::invalid_argument("input text is empty"));
        }
        if text.len() > self.policy.max_input_bytes {
            return Err(BrokerError::resource_exhausted(format!(
                "input exceeds {} bytes",
                self.policy.max_input_bytes
            )));
        }

        let (project_id, provider_id) = {
            let record = entry.record.lock();
            if record.state != SessionState::Running {
                return Err(BrokerError::session_not_running(format!(
                    "session {session_id} is {}",
                    record.state
                )));
            }
            (record.project_id.clone(), record.provider_id.clone())
        };

        entry.control.input.send(text.to_owned()).await?;

        let event = SessionEvent::new(
            EventKind::InputReceived,
            StreamTag::System,
            (self.redact)(text),
        )
        .with_ids(session_id, project_id, provider_id);
        Ok(entry.log.append(event))
    }

    /// Stop a session. Idempotent: stopping a terminal session succeeds
    /// without a second terminal event.
    pub async fn stop_session(&self, session_id: &str, force: bool) -> Result<SessionRecord, BrokerError> {
        let entry = self.entry(session_id).await?;
        stop_entry(&entry, force).await;
        Ok(entry.snapshot())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord, BrokerError> {
        Ok(self.entry(session_id).await?.snapshot())
    }

    /// Snapshot all sessions, optionally filtered by project.
    pub async fn list_sessions(&self, project_id: Option<&str>) -> Vec<SessionRecord> {
        let sessions = self.sessions.read().await;
        let mut records: Vec<SessionRecord> = sessions
            .values()
            .map(|e| e.snapshot())
            .filter(|r| project_id.map_or(true, |p| r.project_id == p))
            .collect();
        records.sort_by_key(|r| (r.created_at_ms, r.session_id.clone()));
        records
    }

    /// Drop a terminated session's record, log, and cursors.
    pub async fn purge_session(&self, session_id: &str) -> Result<(), BrokerError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| BrokerError::not_found(format!("no session {session_id}")))?;
        if !entry.is_terminal() {
            return Err(BrokerError::invalid_argument(format!(
                "session {session_id} is not terminated"
            )));
        }
        sessions.remove(session_id);
        debug!(session = %session_id, "session purged");
        Ok(())
    }

    /// Entry accessor used by the event-streaming dispatch path.
    pub async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, BrokerError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(format!("no session {session_id}")))
    }

    /// (active, total) session counts.
    pub async fn session_counts(&self) -> (usize, usize) {
        let sessions = self.sessions.read().await;
        let active = sessions.values().filter(|e| !e.is_terminal()).count();
        (active, sessions.len())
    }

    /// Stop every session in parallel and end background tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.read().await.values().cloned().collect();
        info!(sessions = entries.len(), "supervisor closing");
        join_all(entries.iter().map(|entry| stop_entry(entry, false))).await;
    }

    /// Periodically evict expired subscriber cursors on every session.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let interval = supervisor.policy.cleanup_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = supervisor.shutdown.cancelled() => {
                        debug!("cleanup task shutting down");
                        return;
                    }
                }
                let entries: Vec<Arc<SessionEntry>> =
                    supervisor.sessions.read().await.values().cloned().collect();
                for entry in entries {
                    let evicted = entry.subscribers.cleanup_expired();
                    if evicted > 0 {
                        debug!(evicted, "expired subscriber cursors removed");
                    }
                }
            }
        });
    }
}

/// Graceful, idempotent teardown of one session.
async fn stop_entry(entry: &SessionEntry, force: bool) {
    {
        let mut record = entry.record.lock();
        if record.state.is_terminal() {
            return;
        }
        record.state = SessionState::Stopping;
    }

    if force {
        entry.control.kill.cancel();
    }
    entry.control.stop.cancel();
    // The adapter's `done` resolves once the subprocess is reaped; waiting
    // for the forwarder instead guarantees the terminal event has also been
    // appended and the record state reflects it.
    entry.control.done.cancelled().await;
    entry.drained.cancelled().await;

    // Safety net for an adapter that closed its stream without a terminal
    // event.
    entry.record.lock().mark_terminal(false, None);
}

/// Pump one adapter's event stream into the session log, redacting text
/// and flipping the record state on the terminal event.
async fn forward_events(
    entry: Arc<SessionEntry>,
    mut events: mpsc::Receiver<SessionEvent>,
    redact: Redactor,
) {
    while let Some(mut event) = events.recv().await {
        event.text = redact(&event.text);
        if let Some(error) = event.error.take() {
            event.error = Some(redact(&error));
        }

        let terminal = event.done;
        let failed = event.kind == EventKind::SessionFailed;
        let error = event.error.clone();
        entry.log.append(event);

        if terminal {
            entry.record.lock().mark_terminal(failed, error);
            if failed {
                warn!(session = %entry.record.lock().session_id, "session failed");
            }
        }
    }
    entry.drained.cancel();
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
