//! Configuration for lspboot
//!
//! Language bundles (profile, dependency catalog, initialize params) are
//! embedded from `registry/`; user settings come from an optional TOML file.

mod catalog;
mod init_params;
mod loader;
pub mod platform;
mod registry;
mod user_config;

pub use catalog::{ArchiveType, DependencyCatalog, DependencyDescriptor, ScriptPath};
pub use init_params::{InitializeParamsTemplate, WorkspaceFolderTemplate};
pub use loader::{ConfigLoader, LanguageBundle};
pub use registry::{ServerProfile, WorkspaceFile};
pub use user_config::{Settings, UserConfig};
