//! Per-language bootstrap strategies
//!
//! The session engine is language-agnostic; everything it needs to know
//! about a particular server comes from a [`BootstrapStrategy`].

use crate::config::{
    ConfigLoader, DependencyCatalog, InitializeParamsTemplate, LanguageBundle, ServerProfile,
};
use crate::logging::LogSink;
use crate::types::LspError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait BootstrapStrategy: Send + Sync {
    /// Language identifier, also sent as the document `languageId`
    fn language(&self) -> &str;

    fn profile(&self) -> &ServerProfile;

    fn catalog(&self) -> &DependencyCatalog;

    fn initialize_params(&self) -> &InitializeParamsTemplate;

    /// Hook run against the workspace before anything is installed or spawned
    async fn prepare(&self, _root: &Path, _logger: &dyn LogSink) -> Result<(), LspError> {
        Ok(())
    }
}

/// Strategy backed by a registry bundle
///
/// `prepare` seeds the profile's workspace files that do not exist yet.
#[derive(Debug, Clone)]
pub struct EmbeddedStrategy {
    bundle: LanguageBundle,
}

impl EmbeddedStrategy {
    pub fn new(bundle: LanguageBundle) -> Self {
        Self { bundle }
    }
}

#[async_trait]
impl BootstrapStrategy for EmbeddedStrategy {
    fn language(&self) -> &str {
        &self.bundle.profile.language
    }

    fn profile(&self) -> &ServerProfile {
        &self.bundle.profile
    }

    fn catalog(&self) -> &DependencyCatalog {
        &self.bundle.catalog
    }

    fn initialize_params(&self) -> &InitializeParamsTemplate {
        &self.bundle.initialize_params
    }

    async fn prepare(&self, root: &Path, logger: &dyn LogSink) -> Result<(), LspError> {
        for file in &self.bundle.profile.workspace_files {
            let path = file.path.under(root);
            if tokio::fs::try_exists(&path).await? {
                continue;
            }

            logger.info(&format!("Creating {}", path.display()));
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.contents).await?;
        }
        Ok(())
    }
}

/// Strategies keyed by language identifier
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn BootstrapStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`EmbeddedStrategy`] per loaded bundle
    pub fn from_config(config: &ConfigLoader) -> Self {
        let mut registry = Self::new();
        for bundle in config.bundles() {
            registry.register(Arc::new(EmbeddedStrategy::new(bundle.clone())));
        }
        registry
    }

    /// Add a strategy, replacing any previous one for the same language
    pub fn register(&mut self, strategy: Arc<dyn BootstrapStrategy>) {
        self.strategies
            .insert(strategy.language().to_string(), strategy);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn BootstrapStrategy>, LspError> {
        self.strategies
            .get(language)
            .cloned()
            .ok_or_else(|| LspError::UnsupportedLanguage(language.to_string()))
    }

    pub fn languages(&self) -> Vec<&str> {
        let mut languages: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        languages.sort_unstable();
        languages
    }

    /// Language whose profile claims the file's extension
    pub fn language_for_file(&self, path: &Path) -> Option<&str> {
        let extension = path.extension()?.to_str()?;
        let mut matches: Vec<&str> = self
            .strategies
            .values()
            .filter(|s| {
                s.profile()
                    .file_extensions
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(extension))
            })
            .map(|s| s.language())
            .collect();
        matches.sort_unstable();
        matches.into_iter().next()
    }
}
