//! Service reload after a certificate swap
//!
//! The reload command is an argv template; `{target}` is replaced with the
//! container or service name. This is the only place the agents spawn
//! processes.

use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};
use warden_config::ReloadConfig;

const TARGET_PLACEHOLDER: &str = "{target}";
const STDERR_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadFailure {
    ContainerNotFound,
    ConfigValidationFailed,
    ExecFailed,
    Exception,
    Timeout,
}

impl ReloadFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadFailure::ContainerNotFound => "container_not_found",
            ReloadFailure::ConfigValidationFailed => "config_validation_failed",
            ReloadFailure::ExecFailed => "exec_failed",
            ReloadFailure::Exception => "exception",
            ReloadFailure::Timeout => "timeout",
        }
    }

    /// Classify a non-zero exit by what the command wrote to stderr
    pub fn classify(stderr: &str) -> Self {
        let stderr = stderr.to_lowercase();
        if stderr.contains("no such container") {
            ReloadFailure::ContainerNotFound
        } else if stderr.contains("test failed")
            || stderr.contains("[emerg]")
            || stderr.contains("configuration")
        {
            ReloadFailure::ConfigValidationFailed
        } else if stderr.contains("not found") {
            ReloadFailure::ContainerNotFound
        } else {
            ReloadFailure::ExecFailed
        }
    }
}

impl fmt::Display for ReloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    Failed { kind: ReloadFailure, detail: String },
}

#[derive(Debug, Clone)]
pub struct ReloadController {
    command: Vec<String>,
}

impl ReloadController {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_config(config: &ReloadConfig) -> Self {
        Self::new(config.command.clone())
    }

    /// The argv that reloading `target` runs
    pub fn command_for(&self, target: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(TARGET_PLACEHOLDER, target))
            .collect()
    }

    /// Reload `target`, waiting at most `timeout_seconds`
    ///
    /// Returns `true` only on a clean zero exit. Failures are logged with
    /// their classification and never raised.
    pub async fn reload(&self, target: &str, timeout_seconds: u64) -> bool {
        match self.run(target, Duration::from_secs(timeout_seconds)).await {
            ReloadOutcome::Reloaded => true,
            ReloadOutcome::Failed { kind, detail } => {
                warn!(service = %target, failure = %kind, detail = %detail, "Service reload failed");
                false
            }
        }
    }

    pub async fn run(&self, target: &str, timeout: Duration) -> ReloadOutcome {
        let argv = self.command_for(target);
        let Some((program, args)) = argv.split_first() else {
            return ReloadOutcome::Failed {
                kind: ReloadFailure::Exception,
                detail: "empty reload command".to_string(),
            };
        };

        let start = Instant::now();
        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(service = %target, program = %program, error = %e, "Failed to spawn reload command");
                return ReloadOutcome::Failed {
                    kind: ReloadFailure::Exception,
                    detail: format!("failed to spawn {program}: {e}"),
                };
            }
        };

        let stderr = child.stderr.take();
        let reader: JoinHandle<String> = tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut captured).await;
            }
            String::from_utf8_lossy(&captured).into_owned()
        });

        match time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                reader.abort();
                info!(
                    service = %target,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Service reloaded"
                );
                ReloadOutcome::Reloaded
            }
            Ok(Ok(status)) => {
                let stderr = collect_stderr(reader).await;
                let code = status
                    .code()
                    .map_or_else(|| "signal".to_string(), |code| code.to_string());
                ReloadOutcome::Failed {
                    kind: ReloadFailure::classify(&stderr),
                    detail: format!("exit {code}: {}", stderr.trim()),
                }
            }
            Ok(Err(e)) => {
                reader.abort();
                ReloadOutcome::Failed {
                    kind: ReloadFailure::Exception,
                    detail: format!("failed waiting for reload command: {e}"),
                }
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    error!(service = %target, error = %e, "Failed to kill timed out reload command");
                }
                reader.abort();
                ReloadOutcome::Failed {
                    kind: ReloadFailure::Timeout,
                    detail: format!("no exit within {}s, killed", timeout.as_secs()),
                }
            }
        }
    }
}

/// Stderr of an exited command; a grandchild may still hold the pipe open
async fn collect_stderr(mut reader: JoinHandle<String>) -> String {
    match time::timeout(STDERR_GRACE, &mut reader).await {
        Ok(Ok(stderr)) => stderr,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            reader.abort();
            String::new()
        }
    }
}
