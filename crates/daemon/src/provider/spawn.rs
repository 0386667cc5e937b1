// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared subprocess plumbing: environment hygiene, process-group spawn,
//! and the graceful-then-forcible termination ladder.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

/// Credential variables never inherited by a child, plus variables that
/// make an agent refuse to run under supervision.
pub const ENV_BLOCKLIST: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
    "DISCORD_TOKEN",
    "CLAUDECODE",
    "CLAUDE_CODE_ENTRYPOINT",
];

/// The inherited environment minus the block-list.
pub fn filtered_env() -> Vec<(String, String)> {
    std::env::vars().filter(|(name, _)| !ENV_BLOCKLIST.contains(&name.as_str())).collect()
}

/// Spawn a child with piped stdio in its own process group so terminal
/// signals never reach the daemon.
pub fn spawn_child(
    binary: &str,
    args: &[String],
    cwd: &Path,
    extra_env: &[(String, String)],
) -> std::io::Result<Child> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(filtered_env())
        .envs(extra_env.iter().cloned())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd.spawn()
}

/// Deliver a signal to the child's whole process group.
pub fn signal_group(pid: u32, signal: Signal) {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return;
    };
    // Negative pid addresses the process group.
    let _ = kill(Pid::from_raw(-pid_i32), signal);
}

/// Whether a process with the given pid is still alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// True when the kill escalation fired before the child exited.
    pub forced: bool,
}

impl ExitOutcome {
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit status {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "exit status unknown".to_owned(),
        }
    }
}

fn outcome_from_status(status: std::process::ExitStatus, forced: bool) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt;
    ExitOutcome { code: status.code(), signal: status.signal(), forced }
}

/// Escalating termination: SIGTERM to the group, wait out the grace
/// period, SIGKILL, wait for the settle. The caller closes stdin first.
///
/// A zero grace (force stop) skips straight to SIGKILL.
pub async fn terminate(child: &mut Child, grace: Duration, settle: Duration) -> ExitOutcome {
    let pid = child.id();

    if !grace.is_zero() {
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGTERM);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return outcome_from_status(status, false),
            Ok(Err(_)) | Err(_) => {}
        }
    }

    if let Some(pid) = pid {
        debug!(pid, "grace expired, escalating to SIGKILL");
        signal_group(pid, Signal::SIGKILL);
    }
    match tokio::time::timeout(settle, child.wait()).await {
        Ok(Ok(status)) => outcome_from_status(status, true),
        Ok(Err(_)) | Err(_) => ExitOutcome { code: None, signal: None, forced: true },
    }
}

/// Wait for a natural exit.
pub async fn wait_exit(child: &mut Child) -> ExitOutcome {
    match child.wait().await {
        Ok(status) => outcome_from_status(status, false),
        Err(_) => ExitOutcome { code: None, signal: None, forced: false },
    }
}

/// Liveness test for a provider binary: an absolute path must exist and be
/// executable; a bare name must resolve through `PATH`.
pub fn binary_available(binary: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let executable = |path: &Path| {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    let path = Path::new(binary);
    if path.is_absolute() {
        return executable(path);
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| executable(&dir.join(binary))))
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
