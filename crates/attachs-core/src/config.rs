//! Configuration types and loading
//!
//! Loaded once at startup and handed to each component's constructor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Path derivation strategy for stored styles
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Hash of (id, style, style configuration); config changes move the path
    #[default]
    ContentHash,
    /// Substitution cipher over the style name
    Obfuscated,
}

impl KeyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentHash => "content_hash",
            Self::Obfuscated => "obfuscated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "content_hash" => Some(Self::ContentHash),
            "obfuscated" => Some(Self::Obfuscated),
            _ => None,
        }
    }
}

/// Where the filesystem backend keeps its files and how it serves them
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Local file storage root
    pub local_path: String,
    /// Base URL prepended to stored paths
    pub base_url: String,
}

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachsConfig {
    /// Namespace prepended to every derived path
    pub prefix: Option<String>,
    /// Fallback asset template for unprocessed attachments (`:style` placeholder)
    pub default_path: Option<String>,
    /// Styles applied to every slot, merged under per-slot styles
    pub global_styles: BTreeMap<String, serde_json::Value>,
    /// Age after which unattached attachments are swept
    pub retention_seconds: u64,
    /// Selected path derivation strategy
    pub key_strategy: KeyStrategy,
    /// URL lifetime handed to backends for private slots
    pub url_expiry_seconds: u64,
    /// Largest accepted upload
    pub max_upload_bytes: u64,
    pub storage: StorageSettings,
    /// YAML file describing attachable owner types
    pub registry_path: Option<String>,
}

impl Default for AttachsConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            default_path: None,
            global_styles: BTreeMap::new(),
            retention_seconds: 86400, // 1 day
            key_strategy: KeyStrategy::default(),
            url_expiry_seconds: 3600,
            max_upload_bytes: 100 * 1024 * 1024, // 100 MB
            storage: StorageSettings {
                local_path: "/var/attachs/storage".to_string(),
                base_url: "/attachments".to_string(),
            },
            registry_path: None,
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Config file error: {0}")]
    FileError(String),
}

impl AttachsConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("ATTACHS_PREFIX") {
            config.prefix = normalize_prefix(&prefix);
        }
        if let Some(path) = lookup("ATTACHS_DEFAULT_PATH") {
            config.default_path = Some(path).filter(|p| !p.is_empty());
        }
        if let Some(raw) = lookup("ATTACHS_GLOBAL_STYLES") {
            config.global_styles =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: "ATTACHS_GLOBAL_STYLES".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(raw) = lookup("ATTACHS_RETENTION_SECONDS") {
            config.retention_seconds = parse_number("ATTACHS_RETENTION_SECONDS", &raw)?;
        }
        if let Some(raw) = lookup("ATTACHS_KEY_STRATEGY") {
            config.key_strategy =
                KeyStrategy::from_str(&raw).ok_or_else(|| ConfigError::InvalidValue {
                    key: "ATTACHS_KEY_STRATEGY".to_string(),
                    message: format!("unknown strategy '{}'", raw),
                })?;
        }
        if let Some(raw) = lookup("ATTACHS_URL_EXPIRY_SECONDS") {
            config.url_expiry_seconds = parse_number("ATTACHS_URL_EXPIRY_SECONDS", &raw)?;
        }
        if let Some(raw) = lookup("ATTACHS_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse_number("ATTACHS_MAX_UPLOAD_BYTES", &raw)?;
        }

        // Storage
        if let Some(path) = lookup("ATTACHS_STORAGE_PATH") {
            config.storage.local_path = path;
        }
        if let Some(url) = lookup("ATTACHS_BASE_URL") {
            config.storage.base_url = url.trim_end_matches('/').to_string();
        }

        config.registry_path = lookup("ATTACHS_REGISTRY_PATH");

        Ok(config)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn url_expiry(&self) -> Duration {
        Duration::from_secs(self.url_expiry_seconds)
    }
}

fn normalize_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not a non-negative integer", raw),
    })
}
