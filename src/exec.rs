//! Async subprocess executor for daemon CLI invocations.
//!
//! Every daemon interaction is an invocation of the external `docker` binary
//! (or a compatible drop-in). This module provides the shared spawn/capture
//! machinery: piped stdio, optional stdin payload for streamed archives,
//! per-call environment, and line-buffered output collection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Per-invocation execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionConfig {
    /// Command timeout; `None` inherits the caller's deadline
    pub timeout: Option<Duration>,
    /// Extra environment variables for the child process
    pub environment: HashMap<String, String>,
    /// Working directory for the child process
    pub working_dir: Option<PathBuf>,
    /// Bytes written to the child's stdin before it is closed
    pub stdin_data: Option<Vec<u8>>,
}

/// Result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the process
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Whether the command exited zero
    pub success: bool,
}

impl CommandOutput {
    /// Create a new command output
    #[must_use]
    pub fn new(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: exit_code == 0,
        }
    }
}

/// Async executor bound to one daemon CLI binary.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    /// Path to the daemon CLI binary
    pub binary: PathBuf,
    default_config: ExecutionConfig,
}

impl ProcessExecutor {
    /// Create a new executor for the given binary path.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            default_config: ExecutionConfig::default(),
        }
    }

    /// Set a default timeout applied to every invocation.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_config.timeout = Some(timeout);
        self
    }

    /// Run the binary with `args`, failing on a non-zero exit code.
    pub async fn execute(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> Result<CommandOutput> {
        let output = self.execute_unchecked(args, config).await?;
        if !output.success {
            let command_str = self.render_command(args);
            return Err(Error::external(
                "daemon",
                format!(
                    "command failed ({}): {command_str}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(output)
    }

    /// Run the binary with `args` and return the output regardless of exit
    /// code. Callers that treat a non-zero exit as data use this directly.
    pub async fn execute_unchecked(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> Result<CommandOutput> {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let command_str = self.render_command(args);

        debug!("executing: {}", command_str);

        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        for (key, value) in &config.environment {
            command.env(key, value);
        }
        if let Some(working_dir) = &config.working_dir {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::external_with("daemon", format!("failed to spawn: {command_str}"), e)
        })?;

        if let Some(stdin_data) = config.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&stdin_data).await {
                        warn!("failed to write to stdin: {}", e);
                    }
                    if let Err(e) = stdin.shutdown().await {
                        warn!("failed to close stdin: {}", e);
                    }
                });
            }
        }

        let output = if let Some(timeout_duration) = config.timeout {
            match timeout(timeout_duration, wait_for_output(child)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::external(
                        "daemon",
                        format!(
                            "timed out after {}s: {command_str}",
                            timeout_duration.as_secs()
                        ),
                    ));
                }
            }
        } else {
            wait_for_output(child).await?
        };

        trace!("exit code {}: {}", output.exit_code, command_str);
        Ok(output)
    }

    fn render_command(&self, args: &[String]) -> String {
        format!(
            "{} {}",
            self.binary.file_name().map_or_else(
                || self.binary.display().to_string(),
                |n| n.to_string_lossy().to_string()
            ),
            args.join(" ")
        )
    }
}

async fn wait_for_output(mut child: Child) -> Result<CommandOutput> {
    let stdout_handle = child.stdout.take().map(|stdout| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut output = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&line);
            }
            output
        })
    });

    let stderr_handle = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut output = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&line);
            }
            output
        })
    });

    let status = child
        .wait()
        .await
        .map_err(|e| Error::external_with("daemon", "failed to wait for process", e))?;

    let stdout = match stdout_handle {
        Some(handle) => handle
            .await
            .map_err(|e| Error::internal("daemon", format!("stdout join error: {e}")))?,
        None => String::new(),
    };
    let stderr = match stderr_handle {
        Some(handle) => handle
            .await
            .map_err(|e| Error::internal("daemon", format!("stderr join error: {e}")))?,
        None => String::new(),
    };

    Ok(CommandOutput::new(status.code().unwrap_or(-1), stdout, stderr))
}

/// Locate the daemon CLI binary on the current system.
pub fn find_daemon_binary() -> Result<PathBuf> {
    which::which("docker")
        .map_err(|_| Error::precondition("daemon", "docker binary not found in PATH"))
}
