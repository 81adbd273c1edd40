use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};

pub const SHEETFLOW_DIR: &str = ".sheetflow";
pub const CONFIG_FILE: &str = "config.toml";
pub const STATES_DIR: &str = "states";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetflowConfig {
    pub orchestrator: OrchestratorConfig,
    pub reasoning: ReasoningConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub url: String,
    pub model: String,
    /// Environment variable holding the bearer token, if any.
    pub api_key_env: Option<String>,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8100".to_string(),
            model: "default".to_string(),
            api_key_env: Some("SHEETFLOW_API_KEY".to_string()),
        }
    }
}

impl ReasoningConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub url: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8200".to_string(),
        }
    }
}

pub fn sheetflow_dir(root: &Path) -> PathBuf {
    root.join(SHEETFLOW_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    sheetflow_dir(root).join(CONFIG_FILE)
}

pub fn states_dir(root: &Path) -> PathBuf {
    sheetflow_dir(root).join(STATES_DIR)
}

impl SheetflowConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config
            .orchestrator
            .validate()
            .context("Invalid orchestrator settings")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Reads `.sheetflow/config.toml` under `root`, falling back to defaults
    /// when the project was never initialized.
    pub fn load(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            tracing::debug!(path = ?path, "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_survive_round_trip() {
        let config = SheetflowConfig::default();
        let content = config.to_toml().unwrap();

        assert!(content.contains("[orchestrator]"));
        assert!(content.contains("[orchestrator.breaker]"));
        assert!(content.contains("[reasoning]"));
        assert!(content.contains("[sandbox]"));
        assert_eq!(SheetflowConfig::from_toml(&content).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = SheetflowConfig::from_toml(
            r#"
            [orchestrator]
            max_retries = 5

            [orchestrator.breaker]
            minimum_requests = 4

            [sandbox]
            url = "http://sandbox:9000"
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.max_retries, 5);
        assert_eq!(config.orchestrator.quality_threshold, 0.8);
        assert_eq!(config.orchestrator.breaker.minimum_requests, 4);
        assert_eq!(config.orchestrator.breaker.failure_threshold, 50.0);
        assert_eq!(config.sandbox.url, "http://sandbox:9000");
        assert_eq!(config.reasoning, ReasoningConfig::default());
    }

    #[test]
    fn test_invalid_orchestrator_settings_rejected() {
        let result = SheetflowConfig::from_toml(
            r#"
            [orchestrator]
            quality_threshold = 1.5
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let root = std::env::temp_dir().join(format!("sheetflow-{}", uuid::Uuid::new_v4()));
        let config = SheetflowConfig::load(&root).unwrap();
        assert_eq!(config, SheetflowConfig::default());
    }

    #[test]
    fn test_api_key_unset_variable() {
        let reasoning = ReasoningConfig {
            api_key_env: Some("SHEETFLOW_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            ..ReasoningConfig::default()
        };
        assert_eq!(reasoning.api_key(), None);
    }
}
