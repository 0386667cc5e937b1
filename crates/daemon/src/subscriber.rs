// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session subscriber cursors: named, reconnectable observers of one
//! event log with at-least-once in-order replay.
//!
//! Each entry stores the last acknowledged sequence and a last-seen wall
//! clock. The table is bounded per session; entries idle past the TTL are
//! removed by the supervisor's cleanup task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::event::SessionEvent;
use crate::event_log::EventLog;

/// Cursor state for one subscriber.
#[derive(Debug, Clone)]
struct Cursor {
    ack_seq: u64,
    last_seen: Instant,
}

/// Result of attaching a subscriber: overflow flag, replay batch, and the
/// live feed opened before the snapshot was taken.
pub struct Attachment {
    pub subscriber_id: String,
    /// True when the cursor fell behind the oldest retained event; the
    /// caller must prepend a buffer-overflow marker before replay.
    pub overflow: bool,
    pub replay: Vec<SessionEvent>,
    pub listener_id: u64,
    pub live: mpsc::Receiver<SessionEvent>,
}

/// Table of subscriber cursors above one [`EventLog`].
pub struct SubscriberManager {
    log: Arc<EventLog>,
    cursors: Mutex<HashMap<String, Cursor>>,
    cap: usize,
    ttl: Duration,
}

impl SubscriberManager {
    pub fn new(log: Arc<EventLog>, cap: usize, ttl: Duration) -> Self {
        Self { log, cursors: Mutex::new(HashMap::new()), cap, ttl }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Attach a subscriber, returning its replay batch plus a live feed.
    ///
    /// A known subscriber's stored cursor dominates the requested
    /// `after_seq`. A fresh opaque id is assigned when `subscriber_id` is
    /// `None`, subject to the per-session cap. The live feed is opened
    /// before the historical snapshot is taken so nothing falls between
    /// replay and live.
    pub fn attach(
        &self,
        subscriber_id: Option<&str>,
        after_seq: u64,
    ) -> Result<Attachment, BrokerError> {
        let id = match subscriber_id {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => Uuid::new_v4().to_string(),
        };

        let effective_after = {
            let mut cursors = self.cursors.lock();
            match cursors.get_mut(&id) {
                Some(cursor) => {
                    cursor.last_seen = Instant::now();
                    after_seq.max(cursor.ack_seq)
                }
                None => {
                    if cursors.len() >= self.cap {
                        return Err(BrokerError::resource_exhausted(format!(
                            "subscriber cap {} reached",
                            self.cap
                        )));
                    }
                    cursors
                        .insert(id.clone(), Cursor { ack_seq: 0, last_seen: Instant::now() });
                    after_seq
                }
            }
        };

        // Live feed first, snapshot second: an event appended in between
        // shows up on both and the caller suppresses the duplicate.
        let (listener_id, live) = self.log.subscribe();
        let replay = self.log.after(effective_after);

        let oldest = self.log.oldest_seq();
        let overflow = oldest > 0 && effective_after > 0 && effective_after < oldest - 1;

        Ok(Attachment { subscriber_id: id, overflow, replay, listener_id, live })
    }

    /// Advance the stored cursor to at least `seq` and refresh last-seen.
    pub fn ack(&self, subscriber_id: &str, seq: u64) {
        let mut cursors = self.cursors.lock();
        if let Some(cursor) = cursors.get_mut(subscriber_id) {
            cursor.ack_seq = cursor.ack_seq.max(seq);
            cursor.last_seen = Instant::now();
        }
    }

    /// Detach the live feed. The cursor entry survives for reconnect.
    pub fn detach(&self, listener_id: u64) {
        self.log.unsubscribe(listener_id);
    }

    /// Remove cursors idle past the TTL. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|_, c| c.last_seen.elapsed() < self.ttl);
        before - cursors.len()
    }

    /// Last acknowledged sequence for a subscriber, if known.
    pub fn ack_seq(&self, subscriber_id: &str) -> Option<u64> {
        self.cursors.lock().get(subscriber_id).map(|c| c.ack_seq)
    }

    /// Number of tracked subscribers.
    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "subscriber_tests.rs"]
mod tests;
