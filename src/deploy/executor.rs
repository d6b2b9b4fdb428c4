//! External command execution
//!
//! Commands run without a shell. Each output stream is read up to a fixed
//! limit; the remainder is drained so the child never blocks on a full pipe.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::gcloud::redact_args;
use super::DeployError;
use crate::config::DeploySettings;

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is an error
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, DeployError>;
}

// ============================================================================
// SBIO: I/O implementation (real process spawner)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    pub fn from_settings(settings: &DeploySettings) -> Self {
        Self::new(settings.command_timeout, settings.max_output_bytes)
    }
}

/// Read at most `limit` bytes, draining anything beyond it.
///
/// Returns the captured bytes and whether the limit was exceeded.
async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    (&mut reader).take(limit as u64 + 1).read_to_end(&mut buf).await?;

    if buf.len() > limit {
        buf.truncate(limit);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
        return Ok((buf, true));
    }

    Ok((buf, false))
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, DeployError> {
        debug!(command = %redact_args(program, args), "Running command");

        let spawn_failed = |message: String| DeployError::SpawnFailed {
            program: program.to_string(),
            message,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("stderr not captured".to_string()))?;

        let limit = self.max_output_bytes;
        let collected = timeout(self.timeout, async {
            tokio::try_join!(
                read_bounded(stdout, limit),
                read_bounded(stderr, limit),
                child.wait()
            )
        })
        .await;

        let ((out, out_over), (err, err_over), status) = match collected {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => return Err(spawn_failed(e.to_string())),
            Err(_) => {
                warn!(program, timeout = ?self.timeout, "Command timed out, killing it");
                let _ = child.start_kill();
                return Err(DeployError::CommandTimeout(self.timeout));
            }
        };

        if out_over || err_over {
            return Err(DeployError::OutputLimitExceeded { limit });
        }

        let stdout = String::from_utf8_lossy(&out).into_owned();
        let stderr = String::from_utf8_lossy(&err).into_owned();

        if !status.success() {
            let exit_info = match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            debug!(program, %exit_info, "Command failed");
            return Err(DeployError::CommandFailed {
                exit_info,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
