//! Cache API: named buckets of request → response snapshots.
//!
//! A [`Cache`] handle is cheap to clone and every clone refers to the same
//! bucket, so in-flight requests can `match_request` and `put` concurrently.
//! Writes to the same key resolve last-write-wins.

use std::sync::Arc;

use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use isokit_net::{Fetcher, NetError, Request, Response};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// Errors from cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(Method),

    #[error("Refusing to cache partial response for {0}")]
    PartialResponse(String),

    #[error("Cache quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Fetching {url} failed: {source}")]
    Fetch {
        url: Url,
        #[source]
        source: NetError,
    },

    #[error("Fetching {url} returned {status}")]
    BadStatus { url: Url, status: StatusCode },
}

/// Request identity used as the cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    pub fn for_request(request: &Request) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self {
            method: request.method.clone(),
            url: url.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Default)]
struct Entries {
    responses: HashMap<CacheKey, Response>,
    used_bytes: u64,
}

/// A single cache bucket.
#[derive(Debug, Clone)]
pub struct Cache {
    name: Arc<str>,
    quota: Option<u64>,
    entries: Arc<RwLock<Entries>>,
}

impl Cache {
    fn new(name: &str, quota: Option<u64>) -> Self {
        Self {
            name: Arc::from(name),
            quota,
            entries: Arc::new(RwLock::new(Entries::default())),
        }
    }

    /// Bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact-match lookup. Returns a snapshot exactly as stored.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let key = CacheKey::for_request(request);
        self.entries.read().await.responses.get(&key).cloned()
    }

    /// Store `response` under `request`, replacing any previous entry.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        self.store_all(vec![(CacheKey::for_request(request), response)])
            .await
    }

    /// Fetch every URL and store the results, or store nothing.
    ///
    /// All fetches run concurrently. A network error or a non-2xx status on
    /// any of them fails the whole call before a single entry is written.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> Result<usize, CacheError> {
        let fetches = urls.iter().cloned().map(|url| async move {
            let request = Request::get(url.clone());
            let key = CacheKey::for_request(&request);
            let response = fetcher
                .fetch(request)
                .await
                .map_err(|source| CacheError::Fetch {
                    url: url.clone(),
                    source,
                })?;
            if !response.ok() {
                return Err(CacheError::BadStatus {
                    url,
                    status: response.status(),
                });
            }
            Ok((key, response))
        });

        let fetched = try_join_all(fetches).await?;
        let count = fetched.len();
        self.store_all(fetched).await?;

        info!(cache = %self.name, entries = count, "Precached resources");
        Ok(count)
    }

    /// Remove the entry for `request`.
    pub async fn delete(&self, request: &Request) -> bool {
        let key = CacheKey::for_request(request);
        let mut entries = self.entries.write().await;
        match entries.responses.remove(&key) {
            Some(old) => {
                entries.used_bytes -= old.body().len() as u64;
                true
            }
            None => false,
        }
    }

    /// All stored keys.
    pub async fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().await.responses.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.responses.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total body bytes held by the bucket.
    pub async fn used_bytes(&self) -> u64 {
        self.entries.read().await.used_bytes
    }

    /// Validate a whole batch, then insert it under one write lock.
    async fn store_all(&self, batch: Vec<(CacheKey, Response)>) -> Result<(), CacheError> {
        let mut incoming: HashMap<CacheKey, Response> = HashMap::with_capacity(batch.len());
        for (key, response) in batch {
            if key.method != Method::GET {
                return Err(CacheError::UnsupportedMethod(key.method));
            }
            if response.status() == StatusCode::PARTIAL_CONTENT {
                return Err(CacheError::PartialResponse(key.url));
            }
            incoming.insert(key, response);
        }

        let mut entries = self.entries.write().await;

        let replaced: u64 = incoming
            .keys()
            .filter_map(|key| entries.responses.get(key))
            .map(|old| old.body().len() as u64)
            .sum();
        let added: u64 = incoming.values().map(|r| r.body().len() as u64).sum();
        let needed = entries.used_bytes - replaced + added;

        if let Some(quota) = self.quota {
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }

        for (key, response) in incoming {
            debug!(cache = %self.name, url = %key.url, "Cache put");
            entries.responses.insert(key, response);
        }
        entries.used_bytes = needed;
        Ok(())
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global).
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
    quota: Option<u64>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose buckets each hold at most `bytes` of body data.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::default()
        }
    }

    /// Open a cache, creating it on first use.
    pub async fn open(&self, name: &str) -> Cache {
        if let Some(cache) = self.caches.read().await.get(name) {
            return cache.clone();
        }

        let mut caches = self.caches.write().await;
        caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = %name, "Opened new cache");
                Cache::new(name, self.quota)
            })
            .clone()
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Vec<String> {
        self.caches.read().await.keys().cloned().collect()
    }
}
