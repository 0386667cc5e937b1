// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderSpec;

/// Daemon brokering access to AI coding-agent subprocesses.
#[derive(Debug, Clone, Parser)]
#[command(name = "aviary", version, about)]
pub struct Config {
    /// Host address to bind.
    #[arg(long, env = "AVIARY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// gRPC port to listen on.
    #[arg(long, env = "AVIARY_PORT", default_value_t = 7433)]
    pub port: u16,

    /// Path to the settings file (providers and session policy).
    #[arg(long, env = "AVIARY_SETTINGS")]
    pub settings: PathBuf,

    /// Server certificate PEM.
    #[arg(long, env = "AVIARY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Server private key PEM.
    #[arg(long, env = "AVIARY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Client CA bundle PEM for mutual TLS.
    #[arg(long, env = "AVIARY_TLS_CLIENT_CA")]
    pub tls_client_ca: Option<PathBuf>,

    /// Serve plaintext (development only).
    #[arg(long, env = "AVIARY_INSECURE")]
    pub insecure: bool,

    /// Static bearer token accepted instead of signed claims (development).
    #[arg(long, env = "AVIARY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "AVIARY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AVIARY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.insecure {
            let missing = [
                ("--tls-cert", &self.tls_cert),
                ("--tls-key", &self.tls_key),
                ("--tls-client-ca", &self.tls_client_ca),
            ]
            .iter()
            .filter(|(_, path)| path.is_none())
            .map(|(flag, _)| *flag)
            .collect::<Vec<_>>();
            if !missing.is_empty() {
                anyhow::bail!(
                    "mutual TLS requires {} (or --insecure for development)",
                    missing.join(", ")
                );
            }
        }
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("--log-format must be json or text");
        }
        Ok(())
    }
}

/// The settings file: provider catalog plus session policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub policy: SessionPolicy,
    pub providers: Vec<ProviderSpec>,
}

impl Settings {
    /// Load and parse the settings file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read settings {}: {e}", path.display()))?;
        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse settings {}: {e}", path.display()))?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("settings declare no providers");
        }
        for provider in &self.providers {
            if provider.id.is_empty() || provider.binary.is_empty() {
                anyhow::bail!("provider entries need id and binary");
            }
        }
        for pattern in &self.policy.allowed_repo_paths {
            if !pattern.starts_with('/') {
                anyhow::bail!("allowed repo path {pattern} is not absolute");
            }
        }
        Ok(())
    }

    /// Refuse to start when a provider's required environment is unset.
    pub fn check_required_env(&self) -> anyhow::Result<()> {
        for provider in &self.providers {
            for name in &provider.required_env {
                if std::env::var_os(name).is_none() {
                    anyhow::bail!("provider {} requires environment variable {name}", provider.id);
                }
            }
        }
        Ok(())
    }
}

/// Process-wide session policy supplied to the supervisor at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(default = "default_max_per_project")]
    pub max_sessions_per_project: usize,
    #[serde(default = "default_max_global")]
    pub max_sessions_global: usize,
    /// Soft cap on one input payload; requests above it are rejected.
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
    /// Absolute path prefixes or glob patterns for working directories.
    #[serde(default)]
    pub allowed_repo_paths: Vec<String>,
    #[serde(default = "default_subscriber_cap")]
    pub subscriber_cap: usize,
    #[serde(default = "default_subscriber_ttl_secs")]
    pub subscriber_ttl_secs: u64,
    /// Events retained per session.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_per_project() -> usize {
    5
}

fn default_max_global() -> usize {
    20
}

fn default_max_input_bytes() -> usize {
    64 * 1024
}

fn default_subscriber_cap() -> usize {
    32
}

fn default_subscriber_ttl_secs() -> u64 {
    3600
}

fn default_event_buffer() -> usize {
    1024
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_sessions_per_project: default_max_per_project(),
            max_sessions_global: default_max_global(),
            max_input_bytes: default_max_input_bytes(),
            allowed_repo_paths: Vec::new(),
            subscriber_cap: default_subscriber_cap(),
            subscriber_ttl_secs: default_subscriber_ttl_secs(),
            event_buffer: default_event_buffer(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl SessionPolicy {
    pub fn subscriber_ttl(&self) -> Duration {
        Duration::from_secs(self.subscriber_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Whether a working directory is admitted by the allow-list.
    ///
    /// Entries containing `*` or `?` match as glob patterns; all others
    /// match as path prefixes, with exact equality counting as a prefix.
    /// An empty allow-list admits nothing.
    pub fn path_allowed(&self, path: &Path) -> bool {
        let Some(candidate) = path.to_str() else {
            return false;
        };
        if !path.is_absolute() {
            return false;
        }
        self.allowed_repo_paths.iter().any(|entry| {
            if entry.contains('*') || entry.contains('?') {
                wildcard_match(entry, candidate)
            } else {
                let prefix = entry.trim_end_matches('/');
                candidate == prefix || candidate.starts_with(&format!("{prefix}/"))
            }
        })
    }
}

/// Glob match where `*` spans any run of characters and `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative backtracking over the last-seen star.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
