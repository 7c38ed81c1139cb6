//! Language server child process

use crate::bootstrap::LaunchSpec;
use crate::logging::LogSink;
use crate::types::LspError;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// A spawned server with piped stdio
///
/// The process is killed when the session is dropped. Stderr is drained in
/// the background so a chatty server never blocks on a full pipe.
pub struct ProcessSession {
    child: Child,
    command: String,
}

impl ProcessSession {
    pub fn spawn(launch: &LaunchSpec, logger: Arc<dyn LogSink>) -> Result<Self, LspError> {
        let command = launch.display();
        logger.info(&format!("Starting language server: {}", command));

        let mut child = Command::new(&launch.command)
            .args(&launch.args)
            .current_dir(&launch.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LspError::SpawnError {
                command: command.clone(),
                source: e,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, logger));
        }

        Ok(Self { child, command })
    }

    /// Hand out the server's stdin and stdout; only succeeds once
    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout), LspError> {
        let stdin = self.child.stdin.take().ok_or_else(|| {
            LspError::ProtocolViolation(format!("stdin of {} already taken", self.command))
        })?;
        let stdout = self.child.stdout.take().ok_or_else(|| {
            LspError::ProtocolViolation(format!("stdout of {} already taken", self.command))
        })?;
        Ok((stdin, stdout))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process if it is still alive and reap it
    pub async fn terminate(&mut self) -> Result<(), LspError> {
        if self.is_running() {
            self.child.kill().await?;
        } else {
            self.child.wait().await?;
        }
        Ok(())
    }
}

async fn drain_stderr(stderr: ChildStderr, logger: Arc<dyn LogSink>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logger.debug(&format!("server stderr: {}", line.trim_end()));
    }
}
