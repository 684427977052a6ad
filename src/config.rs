//! Configuration management for Forkchat
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{ForkchatError, Result};
use crate::media::{JobPolicy, MediaLimits};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Forkchat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream provider settings
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Streaming session behaviour
    #[serde(default)]
    pub session: SessionConfig,
    /// Media storage and limits
    #[serde(default)]
    pub media: MediaConfig,
    /// Database location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Default model for text-only turns
    #[serde(default = "default_model")]
    pub model: String,
    /// Model used when a user turn carries media
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Seconds to wait for response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Environment variable holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Keyring service consulted when the variable is unset
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_token_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_keyring_service() -> String {
    "forkchat".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            vision_model: default_vision_model(),
            request_timeout_seconds: default_request_timeout(),
            token_env: default_token_env(),
            keyring_service: default_keyring_service(),
        }
    }
}

/// Streaming session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Tool-calling rounds allowed per turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Window for batching text deltas, in milliseconds
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
}

fn default_max_tool_rounds() -> u32 {
    5
}

fn default_coalesce_window_ms() -> u64 {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            coalesce_window_ms: default_coalesce_window_ms(),
        }
    }
}

impl SessionConfig {
    /// Coalescing window as a `Duration`
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory for locally stored media; defaults to `<data dir>/media`
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
    /// Ceiling for image downloads
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    /// Ceiling for video downloads
    #[serde(default = "default_max_video_bytes")]
    pub max_video_bytes: usize,
    /// Ceiling for audio downloads
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,
    /// Ceiling for any other download
    #[serde(default = "default_max_other_bytes")]
    pub max_other_bytes: usize,
    /// Delay between generation job polls
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    /// Maximum generation job polls
    #[serde(default = "default_job_max_attempts")]
    pub job_max_attempts: u32,
    /// Wall-clock ceiling for a generation job
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
}

fn default_max_image_bytes() -> usize {
    MediaLimits::default().image
}

fn default_max_video_bytes() -> usize {
    MediaLimits::default().video
}

fn default_max_audio_bytes() -> usize {
    MediaLimits::default().audio
}

fn default_max_other_bytes() -> usize {
    MediaLimits::default().other
}

fn default_job_poll_interval_ms() -> u64 {
    2000
}

fn default_job_max_attempts() -> u32 {
    90
}

fn default_job_timeout_seconds() -> u64 {
    300
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            local_dir: None,
            max_image_bytes: default_max_image_bytes(),
            max_video_bytes: default_max_video_bytes(),
            max_audio_bytes: default_max_audio_bytes(),
            max_other_bytes: default_max_other_bytes(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            job_max_attempts: default_job_max_attempts(),
            job_timeout_seconds: default_job_timeout_seconds(),
        }
    }
}

impl MediaConfig {
    /// Per-mime download ceilings
    pub fn limits(&self) -> MediaLimits {
        MediaLimits {
            image: self.max_image_bytes,
            video: self.max_video_bytes,
            audio: self.max_audio_bytes,
            other: self.max_other_bytes,
        }
    }

    /// Generation job polling bounds
    pub fn job_policy(&self) -> JobPolicy {
        JobPolicy {
            interval: Duration::from_millis(self.job_poll_interval_ms),
            max_attempts: self.job_max_attempts,
            timeout: Duration::from_secs(self.job_timeout_seconds),
        }
    }

    /// Local media directory, resolving the default
    pub fn resolve_local_dir(&self) -> Result<PathBuf> {
        match &self.local_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(crate::storage::data_dir()?.join("media")),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; defaults to `<data dir>/forkchat.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// Built-in tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout for `fetch_url`
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    /// Maximum bytes returned by `fetch_url`
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: usize,
}

fn default_fetch_timeout_seconds() -> u64 {
    30
}

fn default_max_fetch_bytes() -> usize {
    1024 * 1024
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            max_fetch_bytes: default_max_fetch_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used instead. The
    /// result is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or if the merged
    /// configuration is invalid
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);
        config.validate()?;

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ForkchatError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ForkchatError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(api_base) = std::env::var("FORKCHAT_API_BASE") {
            self.provider.api_base = api_base;
        }

        if let Ok(model) = std::env::var("FORKCHAT_MODEL") {
            self.provider.model = model;
        }

        if let Ok(vision_model) = std::env::var("FORKCHAT_VISION_MODEL") {
            self.provider.vision_model = vision_model;
        }

        if let Ok(rounds) = std::env::var("FORKCHAT_MAX_TOOL_ROUNDS") {
            match rounds.parse() {
                Ok(value) => self.session.max_tool_rounds = value,
                Err(_) => tracing::warn!("Invalid FORKCHAT_MAX_TOOL_ROUNDS: {}", rounds),
            }
        }

        if let Ok(db_path) = std::env::var("FORKCHAT_DB") {
            self.storage.db_path = Some(PathBuf::from(db_path));
        }

        if let Ok(media_dir) = std::env::var("FORKCHAT_MEDIA_DIR") {
            self.media.local_dir = Some(PathBuf::from(media_dir));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(api_base) = &cli.api_base {
            self.provider.api_base = api_base.clone();
        }
        if let Some(path) = &cli.storage_path {
            self.storage.db_path = Some(path.clone());
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.provider.model.trim().is_empty() {
            return Err(ForkchatError::Config("provider.model cannot be empty".into()).into());
        }
        if self.provider.vision_model.trim().is_empty() {
            return Err(
                ForkchatError::Config("provider.vision_model cannot be empty".into()).into(),
            );
        }

        match url::Url::parse(&self.provider.api_base) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            _ => {
                return Err(ForkchatError::Config(format!(
                    "provider.api_base must be an http(s) URL, got {}",
                    self.provider.api_base
                ))
                .into())
            }
        }

        if self.provider.request_timeout_seconds == 0 {
            return Err(ForkchatError::Config(
                "provider.request_timeout_seconds must be greater than 0".into(),
            )
            .into());
        }

        if self.session.max_tool_rounds == 0 {
            return Err(ForkchatError::Config(
                "session.max_tool_rounds must be greater than 0".into(),
            )
            .into());
        }

        if self.session.coalesce_window_ms > 1000 {
            return Err(ForkchatError::Config(
                "session.coalesce_window_ms must be at most 1000".into(),
            )
            .into());
        }

        if self.media.job_max_attempts == 0 {
            return Err(
                ForkchatError::Config("media.job_max_attempts must be greater than 0".into())
                    .into(),
            );
        }

        let limits = self.media.limits();
        if [limits.image, limits.video, limits.audio, limits.other].contains(&0) {
            return Err(
                ForkchatError::Config("media byte ceilings must be greater than 0".into()).into(),
            );
        }

        if self.tools.max_fetch_bytes == 0 {
            return Err(
                ForkchatError::Config("tools.max_fetch_bytes must be greater than 0".into())
                    .into(),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use serial_test::serial;

    fn cli() -> Cli {
        Cli {
            config: None,
            verbose: false,
            storage_path: None,
            api_base: None,
            command: Commands::List,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert_eq!(config.provider.vision_model, "gpt-4o");
        assert_eq!(config.session.max_tool_rounds, 5);
        assert_eq!(config.session.coalesce_window(), Duration::from_millis(50));
        assert_eq!(config.media.job_policy().max_attempts, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
provider:
  api_base: http://localhost:8080/v1
  model: llama3
session:
  max_tool_rounds: 2
media:
  max_image_bytes: 1024
tools:
  max_fetch_bytes: 2048
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.provider.api_base, "http://localhost:8080/v1");
        assert_eq!(config.provider.model, "llama3");
        assert_eq!(config.provider.vision_model, "gpt-4o");
        assert_eq!(config.session.max_tool_rounds, 2);
        assert_eq!(config.session.coalesce_window_ms, 50);
        assert_eq!(config.media.limits().image, 1024);
        assert_eq!(config.media.limits().video, 100 * 1024 * 1024);
        assert_eq!(config.tools.max_fetch_bytes, 2048);
    }

    #[test]
    fn test_config_validation_failures() {
        let mut config = Config::default();
        config.provider.model = " ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.provider.api_base = "ftp://example.com".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.max_tool_rounds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.coalesce_window_ms = 5000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.media.max_audio_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.media.job_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        let config = Config::load("nonexistent.yaml", &cli()).unwrap();
        assert_eq!(config.provider.api_base, "https://api.openai.com/v1");
    }

    #[test]
    #[serial]
    fn test_env_and_cli_overrides() {
        std::env::set_var("FORKCHAT_MODEL", "env-model");
        std::env::set_var("FORKCHAT_API_BASE", "http://env.example/v1");
        std::env::set_var("FORKCHAT_MAX_TOOL_ROUNDS", "not-a-number");

        let mut cli = cli();
        cli.api_base = Some("http://cli.example/v1".into());
        cli.storage_path = Some(PathBuf::from("/tmp/forkchat-test.db"));
        let config = Config::load("nonexistent.yaml", &cli).unwrap();

        std::env::remove_var("FORKCHAT_MODEL");
        std::env::remove_var("FORKCHAT_API_BASE");
        std::env::remove_var("FORKCHAT_MAX_TOOL_ROUNDS");

        assert_eq!(config.provider.model, "env-model");
        assert_eq!(config.provider.api_base, "http://cli.example/v1");
        assert_eq!(config.session.max_tool_rounds, 5);
        assert_eq!(
            config.storage.db_path,
            Some(PathBuf::from("/tmp/forkchat-test.db"))
        );
    }

    #[test]
    #[serial]
    fn test_load_invalid_yaml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "provider: [not, a, map]").unwrap();
        assert!(Config::load(path.to_str().unwrap(), &cli()).is_err());
    }
}
