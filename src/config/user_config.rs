//! User configuration file parsing

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Language used when the CLI is not given one
    pub default_language: Option<String>,

    /// Log every JSON-RPC frame exchanged with the server
    pub trace_lsp_communication: bool,

    /// How long `shutdown` waits for the server before forcing it down
    pub shutdown_timeout_secs: u64,

    /// Where language servers are installed (one subdirectory per language)
    pub cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_language: None,
            trace_lsp_communication: false,
            shutdown_timeout_secs: 5,
            cache_dir: None,
        }
    }
}

impl Settings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: UserConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings.shutdown_timeout(), Duration::from_secs(5));
        assert!(!config.settings.trace_lsp_communication);
    }

    #[test]
    fn test_partial_settings() {
        let config: UserConfig = toml::from_str(
            r#"
            [settings]
            trace_lsp_communication = true
            cache_dir = "/var/cache/lspboot"
            "#,
        )
        .unwrap();
        assert!(config.settings.trace_lsp_communication);
        assert_eq!(config.settings.shutdown_timeout_secs, 5);
        assert_eq!(
            config.settings.cache_dir,
            Some(PathBuf::from("/var/cache/lspboot"))
        );
    }
}
