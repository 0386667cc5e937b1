// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-lines adapter: one JSON object per line in each direction.
//!
//! Known stdout shapes: assistant messages carry text content blocks and
//! become stdout events; a result object marks end-of-turn. Anything that
//! is not valid JSON is passed through as raw stdout so nothing the agent
//! prints is lost.

use serde_json::{json, Value};
use tracing::debug;

use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, StreamTag};

use super::spawn::{binary_available, spawn_child};
use super::stdio::{launch, Codec};
use super::{Provider, ProviderSpec, SessionSpec};

pub struct JsonLinesProvider {
    spec: ProviderSpec,
}

impl JsonLinesProvider {
    pub fn new(spec: ProviderSpec) -> Self {
        Self { spec }
    }
}

/// Concatenated text blocks of an assistant message, if any.
pub fn extract_assistant_text(value: &Value) -> Option<String> {
    if value.get("type").and_then(|v| v.as_str()) != Some("assistant") {
        return None;
    }
    let content = value.get("message")?.get("content")?.as_array()?;
    let texts: Vec<&str> = content
        .iter()
        .filter(|block| block.get("type").and_then(|v| v.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
        .collect();
    if texts.is_empty() {
        return None;
    }
    Some(texts.join("\n"))
}

/// Whether the object is an end-of-turn marker.
pub fn is_turn_result(value: &Value) -> bool {
    value.get("type").and_then(|v| v.as_str()) == Some("result")
}

/// Wrap one user input payload for the child's stdin.
pub fn encode_user_message(text: &str) -> String {
    let mut line = json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
    .to_string();
    line.push('\n');
    line
}

/// Decode one stdout line into an event, or `None` for unknown shapes.
pub fn decode_stdout_line(line: &str) -> Option<SessionEvent> {
    if line.trim().is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        // Not JSON: surface as raw output.
        return Some(SessionEvent::new(EventKind::Stdout, StreamTag::Stdout, line));
    };

    if let Some(text) = extract_assistant_text(&value) {
        return Some(SessionEvent::new(EventKind::Stdout, StreamTag::Stdout, text));
    }
    if is_turn_result(&value) {
        let text = value.get("result").and_then(|v| v.as_str()).unwrap_or_default();
        return Some(SessionEvent::new(EventKind::ResponseComplete, StreamTag::System, text));
    }

    debug!(shape = value.get("type").and_then(|v| v.as_str()).unwrap_or("?"), "skipping line");
    None
}

pub(crate) struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_input(&self, text: &str) -> String {
        encode_user_message(text)
    }

    fn decode_stdout(&self, line: &str) -> Option<SessionEvent> {
        decode_stdout_line(line)
    }

    fn ready_on_start(&self) -> bool {
        true
    }
}

impl Provider for JsonLinesProvider {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn mode(&self) -> &'static str {
        "json_lines"
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

    fn startup_timeout(&self) -> std::time::Duration {
        self.spec.startup_timeout()
    }

    fn start(&self, session: SessionSpec) -> super::StartFuture<'_> {
        Box::pin(async move {
            let child = spawn_child(&self.spec.binary, &self.spec.args, &session.repo_path, &[])
                .map_err(|e| {
                    BrokerError::unavailable(format!("spawn {}: {e}", self.spec.binary))
                })?;
            Ok(launch(
                child,
                session,
                self.spec.startup_timeout(),
                self.spec.stop_grace(),
                JsonCodec,
            ))
        })
    }
}

#[cfg(test)]
#[path = "json_lines_tests.rs"]
mod tests;
