//! Language server profile types

use crate::config::ScriptPath;
use serde::{Deserialize, Serialize};

/// A file seeded into the workspace before the server starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceFile {
    /// Path relative to the workspace root
    pub path: ScriptPath,
    pub contents: String,
}

/// Per-language data describing how a bootstrapped server is installed and run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub language: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_extensions: Vec<String>,

    /// Interpreter the entry-point script runs under (looked up on PATH)
    pub runtime: String,

    /// Package manager used for dependency installs (looked up on PATH)
    pub package_manager: String,

    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,

    /// Folder whose non-empty presence means dependencies are installed
    #[serde(default = "default_dependency_store")]
    pub dependency_store: String,

    /// Arguments appended after the entry-point script
    #[serde(default = "default_server_args")]
    pub server_args: Vec<String>,

    /// Written into the workspace when absent; existing files are never touched
    #[serde(default)]
    pub workspace_files: Vec<WorkspaceFile>,
}

fn default_install_args() -> Vec<String> {
    vec!["install".to_string()]
}

fn default_dependency_store() -> String {
    "node_modules".to_string()
}

fn default_server_args() -> Vec<String> {
    vec!["--stdio".to_string()]
}

impl ServerProfile {
    /// Profile for a Node.js server installed with npm
    pub fn node(language: &str, name: &str) -> Self {
        Self {
            language: language.to_string(),
            name: name.to_string(),
            description: String::new(),
            file_extensions: Vec::new(),
            runtime: "node".to_string(),
            package_manager: "npm".to_string(),
            install_args: default_install_args(),
            dependency_store: default_dependency_store(),
            server_args: default_server_args(),
            workspace_files: Vec::new(),
        }
    }
}
