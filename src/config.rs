//! Runtime settings for the preservation pipeline.
//!
//! Settings come from an optional YAML file; every section has defaults so a
//! missing file or a partial one is fine. Command-line flags override the
//! file (see `cli.rs`).
//!
//! ```yaml
//! site_domain: https://archive.example.org
//! custom_domain: cdn.example.org
//! storage_root: /var/lib/article_vault
//! resource_concurrency: 8
//! article_concurrency: 4
//! fetch:
//!   timeout_secs: 30
//!   max_redirects: 10
//!   max_retries: 3
//!   base_delay_ms: 500
//!   max_bytes: 20971520
//! ```

use crate::error::PreserveError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Public base of the site serving stored resources, e.g. `https://archive.example.org`.
    pub site_domain: String,
    /// Bucket/CDN domain; when set, hosted URLs use `https://<custom_domain>` instead.
    pub custom_domain: Option<String>,
    /// Filesystem root of the durable resource store.
    pub storage_root: PathBuf,
    /// Concurrent resource fetches per article.
    pub resource_concurrency: usize,
    /// Articles processed concurrently within one batch.
    pub article_concurrency: usize,
    pub fetch: FetchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            site_domain: "http://localhost:8000".to_string(),
            custom_domain: None,
            storage_root: PathBuf::from("media"),
            resource_concurrency: 8,
            article_concurrency: 4,
            fetch: FetchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    pub max_redirects: usize,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: usize,
    pub base_delay_ms: u64,
    /// Bodies above this size are rejected.
    pub max_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_redirects: 10,
            max_retries: 3,
            base_delay_ms: 500,
            max_bytes: 20 * 1024 * 1024,
            user_agent: concat!("article_vault/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Settings {
    /// Load settings from a YAML file, or defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// [`PreserveError::Config`] if the file cannot be read or parsed, or
    /// fails [`Settings::validate`].
    #[instrument(level = "info", skip_all)]
    pub async fn load(path: Option<&Path>) -> Result<Self, PreserveError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PreserveError::Config(format!("{}: {e}", path.display())))?;
        let settings = Self::from_yaml(&raw)?;
        info!(config_path = %path.display(), "Loaded configuration");
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, PreserveError> {
        let settings: Settings =
            serde_yaml::from_str(raw).map_err(|e| PreserveError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PreserveError> {
        if self.resource_concurrency == 0 || self.article_concurrency == 0 {
            return Err(PreserveError::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.site_domain.is_empty() && self.custom_domain.is_none() {
            return Err(PreserveError::Config(
                "either site_domain or custom_domain is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings = Settings::from_yaml(
            "custom_domain: cdn.example.org\nfetch:\n  max_retries: 1\n",
        )
        .unwrap();
        assert_eq!(settings.custom_domain.as_deref(), Some("cdn.example.org"));
        assert_eq!(settings.fetch.max_retries, 1);
        assert_eq!(settings.fetch.timeout_secs, 30);
        assert_eq!(settings.resource_concurrency, 8);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = Settings::from_yaml("article_concurrency: 0\n").unwrap_err();
        assert!(matches!(err, PreserveError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_without_path_gives_defaults() {
        let settings = Settings::load(None).await.unwrap();
        assert_eq!(settings, Settings::default());
    }
}
