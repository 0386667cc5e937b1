// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded in-memory event log with sequenced appends and live fan-out.
//!
//! Each session owns one log. Appends assign a gap-free sequence starting
//! at 1 and never block: when the ring is full the oldest slot is evicted,
//! and listener notification is a `try_send` that drops the event for that
//! listener when its channel is full. The subscriber layer detects the gap
//! through its cursor and surfaces a buffer-overflow marker.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::event::SessionEvent;

/// Buffer size of each listener channel.
pub const LISTENER_BUFFER: usize = 256;

/// Bounded ring of session events with a monotonic sequence counter.
pub struct EventLog {
    capacity: usize,
    inner: Mutex<LogInner>,
}

struct LogInner {
    events: VecDeque<SessionEvent>,
    next_seq: u64,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

struct Listener {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventLog {
    /// Create a log retaining at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LogInner {
                events: VecDeque::with_capacity(capacity.max(1)),
                next_seq: 1,
                listeners: Vec::new(),
                next_listener_id: 1,
            }),
        }
    }

    /// Append an event, assigning the next sequence number.
    ///
    /// Never blocks. Evicts the oldest retained event when full and
    /// notifies every listener with a non-blocking send; a listener whose
    /// channel is full misses this event, a listener whose channel is
    /// closed is detached.
    pub fn append(&self, mut event: SessionEvent) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        event.seq = seq;

        if inner.events.len() == self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());

        inner.listeners.retain(|l| match l.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        seq
    }

    /// All retained events with seq greater than `after_seq`, in order.
    pub fn after(&self, after_seq: u64) -> Vec<SessionEvent> {
        let inner = self.inner.lock();
        inner.events.iter().filter(|e| e.seq > after_seq).cloned().collect()
    }

    /// Register a new listener and return its id plus the live channel.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push(Listener { id, tx });
        (id, rx)
    }

    /// Detach a listener. The receiver side drains naturally once dropped.
    pub fn unsubscribe(&self, listener_id: u64) {
        self.inner.lock().listeners.retain(|l| l.id != listener_id);
    }

    /// Sequence of the oldest retained event, or 0 when empty.
    pub fn oldest_seq(&self) -> u64 {
        self.inner.lock().events.front().map_or(0, |e| e.seq)
    }

    /// Sequence of the most recent append, or 0 before the first.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of currently attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

#[cfg(test)]
#[path = "event_log_tests.rs"]
mod tests;
