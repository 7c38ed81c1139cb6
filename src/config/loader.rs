//! Configuration loader
//!
//! Two sources:
//! 1. User config (`./.lspboot.toml`, `$LSPBOOT_CONFIG`, `~/.config/lspboot/config.toml`)
//! 2. Language bundles embedded from `registry/<language>/`

use crate::config::{
    DependencyCatalog, InitializeParamsTemplate, ServerProfile, Settings, UserConfig,
};
use crate::logging::LogSink;
use crate::types::LspError;
use include_dir::{include_dir, Dir};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// Embed the registry directory at compile time
static REGISTRY_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/registry");

const PROFILE_FILE: &str = "server.toml";
const CATALOG_FILE: &str = "runtime_dependencies.json";
const INIT_PARAMS_FILE: &str = "initialize_params.json";

/// Everything needed to bootstrap one language's server
#[derive(Debug, Clone)]
pub struct LanguageBundle {
    pub profile: ServerProfile,
    pub catalog: DependencyCatalog,
    pub initialize_params: InitializeParamsTemplate,
}

pub struct ConfigLoader {
    bundles: BTreeMap<String, LanguageBundle>,
    user_config: UserConfig,
}

impl ConfigLoader {
    pub fn new(logger: Arc<dyn LogSink>) -> Result<Self, LspError> {
        let bundles = Self::load_registry(logger.as_ref());
        logger.info(&format!(
            "Loaded {} language bundles from registry",
            bundles.len()
        ));

        let user_config = match Self::load_user_config(logger.as_ref())? {
            Some(config) => {
                logger.info("Loaded user configuration");
                config
            }
            None => UserConfig::default(),
        };

        Ok(Self {
            bundles,
            user_config,
        })
    }

    /// Loader with the embedded registry and an explicit user config
    pub fn with_user_config(logger: Arc<dyn LogSink>, user_config: UserConfig) -> Self {
        Self {
            bundles: Self::load_registry(logger.as_ref()),
            user_config,
        }
    }

    fn load_registry(logger: &dyn LogSink) -> BTreeMap<String, LanguageBundle> {
        let mut bundles = BTreeMap::new();

        for dir in REGISTRY_DIR.dirs() {
            let dir_name = dir.path().display().to_string();
            match Self::load_bundle(dir) {
                Ok(bundle) => {
                    logger.debug(&format!(
                        "Loaded registry bundle: {} for language: {}",
                        bundle.profile.name, bundle.profile.language
                    ));
                    bundles.insert(bundle.profile.language.clone(), bundle);
                }
                Err(e) => {
                    logger.warn(&format!(
                        "Failed to load registry bundle {}: {}",
                        dir_name, e
                    ));
                }
            }
        }

        bundles
    }

    fn load_bundle(dir: &Dir) -> Result<LanguageBundle, LspError> {
        let read = |name: &str| Self::read_bundle_file(dir, name);

        let profile: ServerProfile = toml::from_str(read(PROFILE_FILE)?)
            .map_err(|e| LspError::ConfigError(format!("Failed to parse profile: {}", e)))?;
        let catalog = DependencyCatalog::from_json(read(CATALOG_FILE)?)?;
        let initialize_params = InitializeParamsTemplate::from_json(read(INIT_PARAMS_FILE)?)?;

        Ok(LanguageBundle {
            profile,
            catalog,
            initialize_params,
        })
    }

    fn read_bundle_file<'a>(dir: &'a Dir<'a>, name: &str) -> Result<&'a str, LspError> {
        let path = dir.path().join(name);
        dir.get_file(&path)
            .ok_or_else(|| LspError::ConfigError(format!("Missing {}", path.display())))?
            .contents_utf8()
            .ok_or_else(|| LspError::ConfigError(format!("Invalid UTF-8 in {}", path.display())))
    }

    fn load_user_config(logger: &dyn LogSink) -> Result<Option<UserConfig>, LspError> {
        let mut candidates = Vec::new();

        // Project-specific config
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(".lspboot.toml"));
        }

        // Environment variable
        if let Ok(config_path) = std::env::var("LSPBOOT_CONFIG") {
            candidates.push(PathBuf::from(config_path));
        }

        // User-global config
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("lspboot").join("config.toml"));
        }

        for path in &candidates {
            if path.exists() {
                logger.debug(&format!("Loading user config from: {}", path.display()));
                let content = std::fs::read_to_string(path)
                    .map_err(|e| LspError::ConfigError(format!("Failed to read config: {}", e)))?;

                let config: UserConfig = toml::from_str(&content)
                    .map_err(|e| LspError::ConfigError(format!("Failed to parse config: {}", e)))?;

                return Ok(Some(config));
            }
        }

        logger.debug("No user config file found");
        Ok(None)
    }

    pub fn settings(&self) -> &Settings {
        &self.user_config.settings
    }

    /// Settings as adjusted by command-line flags
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.user_config.settings
    }

    pub fn bundles(&self) -> impl Iterator<Item = &LanguageBundle> {
        self.bundles.values()
    }

    pub fn bundle(&self, language: &str) -> Result<&LanguageBundle, LspError> {
        self.bundles
            .get(language)
            .ok_or_else(|| LspError::UnsupportedLanguage(language.to_string()))
    }

    /// Root directory under which each language's server is installed
    pub fn cache_dir(&self) -> Result<PathBuf, LspError> {
        if let Some(dir) = &self.user_config.settings.cache_dir {
            return Ok(dir.clone());
        }
        Self::default_cache_dir()
    }

    fn default_cache_dir() -> Result<PathBuf, LspError> {
        if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            Ok(PathBuf::from(xdg_data).join("lspboot/servers"))
        } else if let Some(data_dir) = dirs::data_dir() {
            Ok(data_dir.join("lspboot/servers"))
        } else {
            Err(LspError::ConfigError(
                "Cannot determine data directory (no $HOME or $XDG_DATA_HOME)".to_string(),
            ))
        }
    }
}
