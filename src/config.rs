use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::platform::common::{atomic_write, restrict_to_owner};
use crate::protection::remote::RemoteConfig;

const APP_NAME: &str = "usage-protection";

/// Host configuration for the `usage-protection` binary
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub settings: SettingsConfig,

    /// Server sync for an authenticated user (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSection>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the daily usage record lives
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Host application settings file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettingsConfig {
    /// YAML document holding the `usageProtection` object
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,

    /// How often `run` re-reads the file (seconds)
    #[serde(default = "default_reload_interval")]
    pub reload_interval: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteSection {
    #[serde(flatten)]
    pub client: RemoteConfig,

    /// Signed-in user whose data is synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".usage-protection"))
}

fn default_settings_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("settings.yaml"))
        .unwrap_or_else(|| PathBuf::from("settings.yaml"))
}

fn default_reload_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
            reload_interval: default_reload_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Appended to a freshly written config so the optional section is discoverable
const REMOTE_HINT: &str = r#"
# Server sync for a signed-in user (optional)
# [remote]
# base_url = "https://api.example.com/v1"
# user_id = "user-123"
# access_token = "..."
# timeout = 10
"#;

impl HostConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to file. The file may hold a bearer token, so it
    /// is made readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if self.remote.is_none() {
            content.push_str(REMOTE_HINT);
        }

        atomic_write(path, content.as_bytes())?;
        restrict_to_owner(path)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.settings.reload_interval == 0 {
            anyhow::bail!("Settings reload interval must be at least 1 second");
        }

        if let Some(remote) = &self.remote {
            let url = url::Url::parse(&remote.client.base_url).context("Invalid remote base URL")?;
            if url.scheme() != "https" {
                anyhow::bail!("Remote URL must use HTTPS (got: {})", url.scheme());
            }

            if remote.user_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
                anyhow::bail!("Remote user_id must not be empty");
            }

            if remote.client.timeout == 0 {
                anyhow::bail!("Remote timeout must be at least 1 second");
            }
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            anyhow::bail!("Unknown log level: {}", self.logging.level);
        }

        Ok(())
    }
}

/// Get the per-user host config file path
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = project_dirs().context("Could not determine a home directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}
