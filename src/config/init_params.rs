//! `initialize` request parameter templates

use crate::types::LspError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceFolderTemplate {
    pub uri: String,
    pub name: String,
}

/// Structural skeleton of the `initialize` params
///
/// The workspace-dependent fields are overwritten by [`render`](Self::render);
/// anything the template carries beyond the typed fields is passed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParamsTemplate {
    #[serde(rename = "_description", default, skip_serializing)]
    description: Option<Value>,

    #[serde(rename = "processId", default)]
    pub process_id: Option<u32>,

    #[serde(rename = "rootPath", default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,

    #[serde(rename = "rootUri", default)]
    pub root_uri: Option<String>,

    #[serde(default = "empty_object")]
    pub capabilities: Value,

    #[serde(
        rename = "initializationOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub initialization_options: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,

    #[serde(rename = "workspaceFolders", default)]
    pub workspace_folders: Vec<WorkspaceFolderTemplate>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for InitializeParamsTemplate {
    fn default() -> Self {
        Self {
            description: None,
            process_id: None,
            root_path: None,
            root_uri: None,
            capabilities: empty_object(),
            initialization_options: None,
            trace: None,
            workspace_folders: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl InitializeParamsTemplate {
    pub fn from_json(content: &str) -> Result<Self, LspError> {
        serde_json::from_str(content).map_err(|e| {
            LspError::ConfigError(format!("Failed to parse initialize params template: {}", e))
        })
    }

    /// Fill in the workspace fields for `root` and produce the wire params
    pub fn render(&self, root: &Path) -> Result<Value, LspError> {
        let uri = Url::from_file_path(root)
            .map_err(|_| LspError::InvalidPath(root.to_path_buf()))?
            .to_string();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        let mut params = self.clone();
        params.process_id = Some(std::process::id());
        params.root_path = Some(root.display().to_string());
        params.root_uri = Some(uri.clone());

        let folder = WorkspaceFolderTemplate { uri, name };
        match params.workspace_folders.first_mut() {
            Some(first) => *first = folder,
            None => params.workspace_folders.push(folder),
        }

        Ok(serde_json::to_value(params)?)
    }
}
