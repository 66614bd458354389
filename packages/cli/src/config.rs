//! CLI Configuration
//!
//! Stores the API base URL and the agent config path in ~/.crawl-agent/cli.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_API_URL: &str = "http://localhost:8090";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_url: Option<String>,
    /// Agent config file, used to locate the agent's data directory
    pub agent_config: Option<PathBuf>,
}

impl Config {
    /// Get the config file path (~/.crawl-agent/cli.toml)
    pub fn path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".crawl-agent").join("cli.toml"))
    }

    /// Load config from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config at {}", path.display()))?;
        Ok(())
    }

    /// Get API base URL without a trailing slash
    pub fn api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
    }

    /// Agent config path, `config/dev.toml` unless overridden
    pub fn agent_config(&self) -> PathBuf {
        self.agent_config
            .clone()
            .unwrap_or_else(|| PathBuf::from("config/dev.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_url(), "http://localhost:8090");
        assert_eq!(config.agent_config(), PathBuf::from("config/dev.toml"));
    }

    #[test]
    fn test_round_trip_and_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cli.toml");

        let config = Config {
            api_url: Some("https://crawl.example.com/smarteCrawler/".to_string()),
            agent_config: None,
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.api_url(), "https://crawl.example.com/smarteCrawler");
    }
}
