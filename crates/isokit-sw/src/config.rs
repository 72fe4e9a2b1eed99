//! Worker configuration.
//!
//! Resolved once at startup and moved into the worker; nothing reassigns it
//! afterwards. Changing `cache_name` between runs points the worker at a new,
//! empty bucket.

use std::path::Path;

use isokit_common::IsoKitError;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheStorage;

/// Name of the single cache bucket.
pub const DEFAULT_CACHE_NAME: &str = "my-site-cache-v1";

/// URLs populated into the bucket at install time.
pub const DEFAULT_PRECACHE: [&str; 2] = ["/", "/index.html"];

/// Service worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Site origin; root-relative manifest entries resolve against it.
    pub origin: Url,

    /// Cache bucket name.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Precache manifest.
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,

    /// Optional byte quota for the bucket.
    #[serde(default)]
    pub cache_quota_bytes: Option<u64>,
}

fn default_cache_name() -> String {
    DEFAULT_CACHE_NAME.to_string()
}

fn default_precache() -> Vec<String> {
    DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect()
}

impl WorkerConfig {
    /// Configuration with defaults for everything except the origin.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            cache_name: default_cache_name(),
            precache: default_precache(),
            cache_quota_bytes: None,
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> isokit_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IsoKitError::config_with_source("invalid worker config JSON", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> isokit_common::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            IsoKitError::config_with_source(format!("reading {}", path.display()), e)
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> isokit_common::Result<()> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(IsoKitError::config(format!(
                "origin must be http or https, got {}",
                self.origin.scheme()
            )));
        }
        if self.cache_name.trim().is_empty() {
            return Err(IsoKitError::config("cache_name must not be empty"));
        }
        if let Err(e) = self.precache_urls() {
            return Err(IsoKitError::config_with_source("invalid precache entry", e));
        }
        Ok(())
    }

    /// Resolve a root-relative path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        self.origin.join(path)
    }

    /// The precache manifest as absolute URLs, in manifest order.
    pub fn precache_urls(&self) -> Result<Vec<Url>, url::ParseError> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Cache storage honouring `cache_quota_bytes`.
    pub fn cache_storage(&self) -> CacheStorage {
        match self.cache_quota_bytes {
            Some(quota) => CacheStorage::with_quota(quota),
            None => CacheStorage::new(),
        }
    }
}
