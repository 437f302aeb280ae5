//! Session Configuration
//!
//! Loaded from TOML or JSON. Platforms that run the tunnel engine in a
//! separate extension process need three extra identifiers; everything
//! else has defaults.
//!
//! ```toml
//! platform = "ios"
//! group_identifier = "group.com.example.vpn"
//! localized_description = "Example VPN"
//! provider_bundle_identifier = "com.example.vpn.tunnel"
//! merge_policy = "prefer_group"
//! ```

use crate::bus::MergePolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Target platform of the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Macos,
    Linux,
    Windows,
}

impl Platform {
    /// Platform this binary was built for
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// Does the engine run in an isolated extension process?
    pub fn isolates_engine(&self) -> bool {
        matches!(self, Platform::Ios | Platform::Macos)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Macos => "macos",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// Identifiers the engine needs to reach its extension process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Shared group namespace
    pub group_identifier: String,
    /// Name shown in the system VPN settings
    pub localized_description: String,
    /// Bundle identifier of the tunnel provider extension
    pub provider_bundle_identifier: String,
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Target platform
    #[serde(default = "Platform::current")]
    pub platform: Platform,
    /// Name of the main namespace
    #[serde(default = "default_main_namespace")]
    pub main_namespace: String,
    /// Shared group namespace (isolated platforms)
    #[serde(default)]
    pub group_identifier: Option<String>,
    /// VPN name shown by the system (isolated platforms)
    #[serde(default)]
    pub localized_description: Option<String>,
    /// Tunnel provider bundle (isolated platforms)
    #[serde(default)]
    pub provider_bundle_identifier: Option<String>,
    /// Cross-namespace merge policy
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Directory of file-backed namespaces
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// How often file-backed namespaces are re-read (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_main_namespace() -> String {
    "tunlink".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl SessionConfig {
    /// Configuration for a platform with defaults everywhere else
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            main_namespace: default_main_namespace(),
            group_identifier: None,
            localized_description: None,
            provider_bundle_identifier: None,
            merge_policy: MergePolicy::default(),
            store_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Configuration for an isolated platform
    pub fn isolated(
        platform: Platform,
        group_identifier: impl Into<String>,
        localized_description: impl Into<String>,
        provider_bundle_identifier: impl Into<String>,
    ) -> Self {
        Self {
            group_identifier: Some(group_identifier.into()),
            localized_description: Some(localized_description.into()),
            provider_bundle_identifier: Some(provider_bundle_identifier.into()),
            ..Self::new(platform)
        }
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Export as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Isolation identifiers, if all three are present
    pub fn isolation(&self) -> Option<IsolationConfig> {
        Some(IsolationConfig {
            group_identifier: present(&self.group_identifier)?.to_string(),
            localized_description: present(&self.localized_description)?.to_string(),
            provider_bundle_identifier: present(&self.provider_bundle_identifier)?.to_string(),
        })
    }

    /// Polling interval for file-backed namespaces
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }

        if self.platform.isolates_engine() {
            if present(&self.group_identifier).is_none() {
                return Err(ConfigError::MissingIsolationField("group_identifier"));
            }
            if present(&self.localized_description).is_none() {
                return Err(ConfigError::MissingIsolationField("localized_description"));
            }
            if present(&self.provider_bundle_identifier).is_none() {
                return Err(ConfigError::MissingIsolationField(
                    "provider_bundle_identifier",
                ));
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Platform::current())
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|v| !v.trim().is_empty())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing {0}, required when the engine runs in an extension")]
    MissingIsolationField(&'static str),

    #[error("Main namespace name is empty")]
    EmptyNamespace,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}
