use std::path::PathBuf;
use thiserror::Error;

use crate::lsp::SessionState;

#[derive(Error, Debug)]
pub enum LspError {
    #[error("Unsupported platform: {platform}. Supported platforms: {}", .supported.join(", "))]
    UnsupportedPlatform {
        platform: String,
        supported: Vec<String>,
    },

    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("Required tool '{tool}' was not found on PATH")]
    ToolNotFound { tool: String },

    #[error("Failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Language server was not found at {} after extraction", .0.display())]
    MissingExtraction(PathBuf),

    #[error("Expected package install directory {} does not exist", .0.display())]
    MissingInstallDir(PathBuf),

    #[error("'{command}' failed in {} with exit code {}", .dir.display(), exit_code_label(.code))]
    InstallFailed {
        dir: PathBuf,
        command: String,
        code: Option<i32>,
    },

    #[error("Compile working directory {} does not exist", .0.display())]
    MissingCompileDir(PathBuf),

    #[error("Compile command '{command}' failed in {} with exit code {}", .dir.display(), exit_code_label(.code))]
    CompileFailed {
        dir: PathBuf,
        command: String,
        code: Option<i32>,
    },

    #[error("Language server entry point not found at {}", .0.display())]
    EntryPointNotFound(PathBuf),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnError {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("LSP protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Failed to decode message from language server: {0}")]
    TransportDecode(String),

    #[error("Language server closed the connection")]
    ConnectionClosed,

    #[error("Language server returned error {code}: {message}")]
    ResponseError { code: i32, message: String },

    #[error("Timed out after {0}s waiting for the language server to shut down")]
    ShutdownTimeout(u64),

    #[error("Cannot {action} while the session is {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("Language server is not ready (session is {0})")]
    NotReady(SessionState),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid file path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}
