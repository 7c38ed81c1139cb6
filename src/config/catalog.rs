//! Runtime dependency catalog
//!
//! A catalog lists, per platform, where to download a language server from and
//! how the extracted tree is laid out. Catalog files look like:
//!
//! ```json
//! {
//!   "_description": "ignored",
//!   "runtimeDependencies": [
//!     {
//!       "platformId": "linux-x64",
//!       "url": "https://example.com/server.zip",
//!       "archiveType": "zip",
//!       "relative_extraction_path": "server",
//!       "serverScript": "out/server.js",
//!       "npmInstallDirs": ["."]
//!     }
//!   ]
//! }
//! ```

use crate::types::LspError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Archive formats the fetcher knows how to unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    #[serde(alias = "vsix")]
    Zip,
    Tar,
    #[serde(alias = "tar.gz", alias = "tgz")]
    Gztar,
    /// A single gzip-compressed file
    Gz,
    /// The download is the artifact itself
    Binary,
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveType::Zip => "zip",
            ArchiveType::Tar => "tar",
            ArchiveType::Gztar => "gztar",
            ArchiveType::Gz => "gz",
            ArchiveType::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Entry-point script path, stored as `/`-separated segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScriptPath(Vec<String>);

impl ScriptPath {
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Resolve the script below an extraction directory
    pub fn under(&self, base: &Path) -> PathBuf {
        self.0.iter().fold(base.to_path_buf(), |path, seg| path.join(seg))
    }
}

impl TryFrom<String> for ScriptPath {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let segments: Vec<String> = value.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty() || s == "..") {
            return Err(format!("invalid server script path '{}'", value));
        }
        Ok(Self(segments))
    }
}

impl From<ScriptPath> for String {
    fn from(path: ScriptPath) -> Self {
        path.0.join("/")
    }
}

fn default_compile_dir() -> String {
    ".".to_string()
}

/// One platform's download and layout description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyDescriptor {
    #[serde(rename = "platformId")]
    pub platform_id: String,

    pub url: String,

    #[serde(rename = "archiveType")]
    pub archive_type: ArchiveType,

    /// Directory (below the install root) the archive extracts to
    pub relative_extraction_path: String,

    /// Older layouts checked after the primary one
    #[serde(rename = "legacyRelativeExtractionPaths", default)]
    pub legacy_extraction_paths: Vec<String>,

    #[serde(rename = "serverScript")]
    pub server_script: ScriptPath,

    /// Directories (below the extraction path) needing a package install
    #[serde(rename = "npmInstallDirs", default)]
    pub package_install_dirs: Vec<String>,

    #[serde(rename = "compileCommand", default)]
    pub compile_command: Option<String>,

    #[serde(rename = "compileWorkingDirectory", default = "default_compile_dir")]
    pub compile_working_directory: String,

    /// Server-specific fields this crate does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DependencyDescriptor {
    /// Extraction paths to check, primary first
    pub fn candidate_extraction_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.relative_extraction_path.as_str())
            .chain(self.legacy_extraction_paths.iter().map(String::as_str))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "runtimeDependencies")]
    runtime_dependencies: Vec<DependencyDescriptor>,
}

/// All descriptors for one language server, keyed by platform
#[derive(Debug, Clone)]
pub struct DependencyCatalog {
    descriptors: Vec<DependencyDescriptor>,
}

impl DependencyCatalog {
    pub fn new(descriptors: Vec<DependencyDescriptor>) -> Result<Self, LspError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.platform_id.as_str()) {
                return Err(LspError::ConfigError(format!(
                    "Platform '{}' is listed more than once in the dependency catalog",
                    descriptor.platform_id
                )));
            }
        }
        Ok(Self { descriptors })
    }

    pub fn from_json(content: &str) -> Result<Self, LspError> {
        let file: CatalogFile = serde_json::from_str(content).map_err(|e| {
            LspError::ConfigError(format!("Failed to parse dependency catalog: {}", e))
        })?;
        Self::new(file.runtime_dependencies)
    }

    pub fn platforms(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .map(|d| d.platform_id.clone())
            .collect()
    }

    /// Find the descriptor for a platform id
    pub fn resolve(&self, platform_id: &str) -> Result<&DependencyDescriptor, LspError> {
        self.descriptors
            .iter()
            .find(|d| d.platform_id == platform_id)
            .ok_or_else(|| LspError::UnsupportedPlatform {
                platform: platform_id.to_string(),
                supported: self.platforms(),
            })
    }
}
