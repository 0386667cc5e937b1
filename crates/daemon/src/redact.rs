// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Secret redaction applied to event text before it reaches the log.
//!
//! The transform is injected into the supervisor as a plain function so
//! deployments can swap in their own rules. It must be idempotent and must
//! leave non-matching text untouched; the default rules guarantee both by
//! using a replacement that none of the patterns can match.

use std::sync::Arc;

use regex::Regex;

/// A pure text transform applied to `Event.text` and `Event.error`.
pub type Redactor = Arc<dyn Fn(&str) -> String + Send + Sync>;

const REPLACEMENT: &str = "[redacted]";

/// Pattern set recognized by the default redactor.
///
/// Covers long API-key shapes (Anthropic, OpenAI, GitHub, AWS access keys),
/// bearer headers, and `NAME=value` assignments of credential-looking
/// variables.
fn default_rules() -> Vec<(Regex, String)> {
    let patterns: &[(&str, &str)] = &[
        // Vendor API keys.
        (r"sk-ant-[A-Za-z0-9_-]{8,}", REPLACEMENT),
        (r"sk-[A-Za-z0-9]{20,}", REPLACEMENT),
        (r"gh[pousr]_[A-Za-z0-9]{20,}", REPLACEMENT),
        (r"xox[baprs]-[A-Za-z0-9-]{10,}", REPLACEMENT),
        (r"AKIA[0-9A-Z]{16}", REPLACEMENT),
        // Authorization headers.
        (r"(?i)(bearer\s+)[A-Za-z0-9._~+/-]+=*", "${1}[redacted]"),
        // KEY=value assignments for credential-looking names.
        (
            r"(?i)\b([A-Z0-9_]*(?:TOKEN|SECRET|PASSWORD|API_KEY|ACCESS_KEY)[A-Z0-9_]*)=\S+",
            "${1}=[redacted]",
        ),
    ];

    patterns
        .iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|re| (re, (*replacement).to_owned()))
        })
        .collect()
}

/// Build the default redactor from the built-in rule set.
pub fn default_redactor() -> Redactor {
    let rules = default_rules();
    Arc::new(move |input: &str| {
        let mut out = input.to_owned();
        for (re, replacement) in &rules {
            out = re.replace_all(&out, replacement.as_str()).into_owned();
        }
        out
    })
}

/// A redactor that passes text through unchanged (tests, trusted setups).
pub fn noop_redactor() -> Redactor {
    Arc::new(|input: &str| input.to_owned())
}

#[cfg(test)]
#[path = "redact_tests.rs"]
mod tests;
