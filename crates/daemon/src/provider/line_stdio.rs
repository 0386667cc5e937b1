// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Line-oriented stdio adapter: every non-blank stdout/stderr line is one
//! event; input is written with a trailing newline.

use crate::error::BrokerError;
use crate::event::{EventKind, SessionEvent, StreamTag};

use super::spawn::{binary_available, spawn_child};
use super::stdio::{launch, Codec};
use super::{Provider, ProviderSpec, SessionSpec};

pub struct LineStdioProvider {
    spec: ProviderSpec,
}

impl LineStdioProvider {
    pub fn new(spec: ProviderSpec) -> Self {
        Self { spec }
    }
}

pub(crate) struct PlainCodec;

impl Codec for PlainCodec {
    fn encode_input(&self, text: &str) -> String {
        if text.ends_with('\n') {
            text.to_owned()
        } else {
            format!("{text}\n")
        }
    }

    fn decode_stdout(&self, line: &str) -> Option<SessionEvent> {
        if line.trim().is_empty() {
            None
        } else {
            Some(SessionEvent::new(EventKind::Stdout, StreamTag::Stdout, line))
        }
    }
}

impl Provider for LineStdioProvider {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn mode(&self) -> &'static str {
        "line_stdio"
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
                PlainCodec,
            ))
        })
    }
}

#[cfg(test)]
#[path = "line_stdio_tests.rs"]
mod tests;
