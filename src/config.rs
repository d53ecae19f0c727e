use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::coverage::DEFAULT_MAX_FILE_DELETIONS;
use crate::diff::DEFAULT_MIN_LINE_CHARS;

pub const DEFAULT_CONFIG_FILE: &str = ".review-coverage.toml";
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const DEFAULT_BITBUCKET_API: &str = "https://api.bitbucket.org/2.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration loaded from .review-coverage.toml.
/// All fields are optional; the tool works with zero config given credentials
/// in the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coverage: CoverageConfig,

    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub bitbucket: BitbucketConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Deleted lines shorter than this (after trimming) are not attributed
    pub min_line_chars: usize,
    /// Files with more removed lines than this are skipped unfetched
    pub max_file_deletions: usize,
    /// Upper bound for every provider request
    pub request_timeout_secs: u64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            min_line_chars: DEFAULT_MIN_LINE_CHARS,
            max_file_deletions: DEFAULT_MAX_FILE_DELETIONS,
            request_timeout_secs: 30,
        }
    }
}

impl CoverageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    pub token: Option<String>,
    /// API root, for GitHub Enterprise
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BitbucketConfig {
    /// Falls back to BITBUCKET_USERNAME
    pub username: Option<String>,
    /// Falls back to BITBUCKET_APP_PASSWORD
    pub app_password: Option<String>,
    pub api_url: Option<String>,
}

impl Config {
    /// Load configuration from `path`, or from .review-coverage.toml in the
    /// current directory. A missing default file yields the default config.
    /// Credentials missing from the file are taken from the environment.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from(default_path)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a specific path (useful for testing).
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.github.token.is_none() {
            self.github.token = lookup("GITHUB_TOKEN");
        }
        if self.bitbucket.username.is_none() {
            self.bitbucket.username = lookup("BITBUCKET_USERNAME");
        }
        if self.bitbucket.app_password.is_none() {
            self.bitbucket.app_password = lookup("BITBUCKET_APP_PASSWORD");
        }
    }

    pub fn github_api_url(&self) -> &str {
        self.github.api_url.as_deref().unwrap_or(DEFAULT_GITHUB_API)
    }

    pub fn bitbucket_api_url(&self) -> &str {
        self.bitbucket
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_BITBUCKET_API)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.github.token.is_none());
        assert_eq!(config.coverage.min_line_chars, 4);
        assert_eq!(config.coverage.max_file_deletions, 2000);
        assert_eq!(config.coverage.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.github_api_url(), "https://api.github.com");
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[coverage]
max_file_deletions = 500

[github]
api_url = "https://github.example.com/api/v3"

[bitbucket]
username = "auditor"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coverage.max_file_deletions, 500);
        assert_eq!(config.coverage.min_line_chars, 4);
        assert_eq!(config.github_api_url(), "https://github.example.com/api/v3");
        assert_eq!(config.bitbucket.username.as_deref(), Some("auditor"));
        assert_eq!(config.bitbucket_api_url(), "https://api.bitbucket.org/2.0");
    }

    #[test]
    fn test_env_fills_only_missing_credentials() {
        let mut config: Config = toml::from_str("[github]\ntoken = \"from-file\"\n").unwrap();
        config.apply_env(|key| Some(format!("env-{key}")));
        assert_eq!(config.github.token.as_deref(), Some("from-file"));
        assert_eq!(config.bitbucket.username.as_deref(), Some("env-BITBUCKET_USERNAME"));
        assert_eq!(
            config.bitbucket.app_password.as_deref(),
            Some("env-BITBUCKET_APP_PASSWORD")
        );
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let missing = std::env::temp_dir().join("review-coverage-missing-config.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::FileRead(_))
        ));
    }
}
