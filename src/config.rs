use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::poll::PollPolicy;

fn default_port() -> u16 {
    3000
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("articulator.sqlite")
}

fn default_max_upload_bytes() -> usize {
    500 * 1024 * 1024
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_api_key_env() -> String {
    "GOOGLE_GENERATIVE_AI_API_KEY".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash-preview-05-20".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    120
}

fn default_deadline_secs() -> u64 {
    300
}

/// Server configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory where uploaded recordings are stored (default: uploads)
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// SQLite file holding sessions, videos and messages
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Largest accepted multipart body (default: 500 MiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Model provider settings (maps to [provider] section in TOML)
    #[serde(default)]
    pub provider: ProviderConfig,
    /// File processing poll settings (maps to [polling] section in TOML)
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Model provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the Generative Language API
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used for analysis and chat
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            model: default_model(),
        }
    }
}

/// Limits for waiting on remote file processing
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl PollingConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_attempts: self.max_attempts,
            deadline: Duration::from_secs(self.deadline_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            uploads_dir: default_uploads_dir(),
            database_path: default_database_path(),
            max_upload_bytes: default_max_upload_bytes(),
            provider: ProviderConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that can never serve a request
    pub fn validate(&self) -> Result<(), String> {
        // The last component doubles as the allow-listed segment of /video/ paths
        if self.uploads_dir.file_name().is_none() {
            return Err(format!(
                "uploads_dir '{}' must end in a directory name",
                self.uploads_dir.display()
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err("max_upload_bytes must be greater than 0".to_string());
        }
        if self.provider.model.trim().is_empty() {
            return Err("[provider] model must not be empty".to_string());
        }
        if !self.provider.api_base.starts_with("http://")
            && !self.provider.api_base.starts_with("https://")
        {
            return Err(format!(
                "[provider] api_base must be an http(s) URL, got '{}'",
                self.provider.api_base
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err("[polling] interval_ms must be greater than 0".to_string());
        }
        if self.polling.max_attempts == 0 {
            return Err("[polling] max_attempts must be greater than 0".to_string());
        }
        if self.polling.deadline_secs == 0 {
            return Err("[polling] deadline_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String, String> {
        match std::env::var(&self.provider.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(format!(
                "Environment variable {} is not set",
                self.provider.api_key_env
            )),
        }
    }
}
