//! Client configuration management.
//!
//! This module handles loading the client configuration: the API
//! base URL, timeouts, retry policy, passive renewal interval, per-domain
//! cache TTLs, and where credentials are kept.
//!
//! Configuration is stored at `~/.config/edudash/config.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheDomain;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "edudash";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the API base URL
pub const API_URL_ENV: &str = "EDUDASH_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Access tokens live 30 minutes; renewing at 25 keeps idle tabs signed in.
const DEFAULT_PASSIVE_RENEWAL_MINUTES: u64 = 25;
const MAX_PASSIVE_RENEWAL_MINUTES: u64 = 24 * 60;

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    Keyring,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub passive_renewal_minutes: u64,
    pub retry: RetryConfig,
    /// Per-domain TTL overrides in seconds
    pub cache_ttl_secs: HashMap<CacheDomain, u64>,
    pub credential_backend: CredentialBackend,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            passive_renewal_minutes: DEFAULT_PASSIVE_RENEWAL_MINUTES,
            retry: RetryConfig::default(),
            cache_ttl_secs: HashMap::new(),
            credential_backend: CredentialBackend::default(),
        }
    }
}

impl ClientConfig {
    /// Load from the config file (defaults if absent), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.is_empty() {
                self.api_base_url = url;
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Clamped to between one minute and a day
    pub fn passive_renewal_interval(&self) -> Duration {
        let minutes = self
            .passive_renewal_minutes
            .clamp(1, MAX_PASSIVE_RENEWAL_MINUTES);
        Duration::from_secs(minutes.saturating_mul(60))
    }

    pub fn cache_ttl(&self, domain: CacheDomain) -> Duration {
        self.cache_ttl_secs
            .get(&domain)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| domain.default_ttl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url(), "http://127.0.0.1:8000/api");
        assert_eq!(config.passive_renewal_interval(), Duration::from_secs(25 * 60));
        assert_eq!(config.retry.backoff(), Duration::from_secs(1));
        assert_eq!(config.credential_backend, CredentialBackend::Keyring);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"api_base_url": "https://school.example.org/api/", "cache_ttl_secs": {"messaging": 15}}"#,
        )
        .unwrap();
        assert_eq!(config.base_url(), "https://school.example.org/api");
        assert_eq!(config.cache_ttl(CacheDomain::Messaging), Duration::from_secs(15));
        assert_eq!(config.cache_ttl(CacheDomain::Grades), Duration::from_secs(300));
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_passive_renewal_interval_is_clamped() {
        let zero: ClientConfig = serde_json::from_str(r#"{"passive_renewal_minutes": 0}"#).unwrap();
        assert_eq!(zero.passive_renewal_interval(), Duration::from_secs(60));

        let huge = ClientConfig {
            passive_renewal_minutes: u64::MAX,
            ..ClientConfig::default()
        };
        assert_eq!(huge.passive_renewal_interval(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_credential_backend_parses() {
        let config: ClientConfig = serde_json::from_str(r#"{"credential_backend": "file"}"#).unwrap();
        assert_eq!(config.credential_backend, CredentialBackend::File);
    }
}
