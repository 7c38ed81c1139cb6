//! External command execution with streamed output

use crate::logging::LogSink;
use crate::types::LspError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// A command to run to completion in a working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    display: String,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[String], cwd: &Path) -> Self {
        let display = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            display,
        }
    }

    /// Run `command` through the platform shell
    pub fn shell(command: &str, cwd: &Path) -> Self {
        #[cfg(windows)]
        let (program, flag) = ("cmd", "/C");
        #[cfg(not(windows))]
        let (program, flag) = ("sh", "-c");

        Self {
            program: PathBuf::from(program),
            args: vec![flag.to_string(), command.to_string()],
            cwd: cwd.to_path_buf(),
            display: command.to_string(),
        }
    }

    /// Run an already resolved executable; the logged command line keeps the short name
    pub fn with_program(mut self, program: &Path) -> Self {
        self.program = program.to_path_buf();
        self
    }

    /// Human-readable command line for logs and errors
    pub fn display(&self) -> &str {
        &self.display
    }
}

/// Runs external commands (package installs, builds)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion and return its exit code
    ///
    /// `None` means the process was terminated by a signal.
    async fn run(&self, command: &CommandSpec) -> Result<Option<i32>, LspError>;
}

/// Runner that forwards each stdout/stderr line to the log sink
pub struct StreamingCommandRunner {
    logger: Arc<dyn LogSink>,
}

impl StreamingCommandRunner {
    pub fn new(logger: Arc<dyn LogSink>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl CommandRunner for StreamingCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<Option<i32>, LspError> {
        self.logger
            .info(&format!("Executing command: {}", command.display()));

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LspError::ToolNotFound {
                        tool: command.program.display().to_string(),
                    }
                } else {
                    LspError::SpawnError {
                        command: command.display().to_string(),
                        source: e,
                    }
                }
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, _, status) = tokio::join!(
            forward_lines(stdout, self.logger.as_ref()),
            forward_lines(stderr, self.logger.as_ref()),
            child.wait(),
        );

        Ok(status?.code())
    }
}

async fn forward_lines<R>(stream: Option<R>, logger: &dyn LogSink)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };

    // Drain until EOF; undecodable bytes are replaced, not fatal
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => logger.info(String::from_utf8_lossy(&line).trim_end()),
            Err(e) => {
                logger.warn(&format!("Failed to read command output: {}", e));
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use tracing::Level;

    #[tokio::test]
    async fn test_streams_both_outputs() {
        let sink = Arc::new(MemorySink::new());
        let runner = StreamingCommandRunner::new(sink.clone());
        let dir = tempfile::tempdir().unwrap();

        let command = CommandSpec::shell("echo first; echo second 1>&2", dir.path());
        let code = runner.run(&command).await.unwrap();

        assert_eq!(code, Some(0));
        let messages = sink.messages();
        assert!(messages.contains(&"first".to_string()));
        assert!(messages.contains(&"second".to_string()));
        assert!(sink.contains(Level::INFO, "Executing command: echo first"));
    }

    #[tokio::test]
    async fn test_reports_exit_code() {
        let runner = StreamingCommandRunner::new(Arc::new(MemorySink::new()));
        let dir = tempfile::tempdir().unwrap();

        let code = runner
            .run(&CommandSpec::shell("exit 3", dir.path()))
            .await
            .unwrap();
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let sink = Arc::new(MemorySink::new());
        let runner = StreamingCommandRunner::new(sink.clone());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();

        runner
            .run(&CommandSpec::new("ls", &[], dir.path()))
            .await
            .unwrap();
        assert!(sink.messages().contains(&"marker.txt".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = StreamingCommandRunner::new(Arc::new(MemorySink::new()));
        let dir = tempfile::tempdir().unwrap();

        let result = runner
            .run(&CommandSpec::new("lspboot-no-such-tool", &[], dir.path()))
            .await;
        assert!(matches!(result, Err(LspError::ToolNotFound { .. })));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_streaming() {
        let sink = Arc::new(MemorySink::new());
        let runner = StreamingCommandRunner::new(sink.clone());
        let dir = tempfile::tempdir().unwrap();

        let command = CommandSpec::shell(
            "printf 'bad \\377 byte\\n'; i=0; while [ $i -lt 2000 ]; do echo filler; i=$((i+1)); done; echo done",
            dir.path(),
        );
        let code = runner.run(&command).await.unwrap();

        assert_eq!(code, Some(0));
        let messages = sink.messages();
        assert!(messages.contains(&"bad \u{FFFD} byte".to_string()));
        assert!(messages.contains(&"done".to_string()));
    }
}
