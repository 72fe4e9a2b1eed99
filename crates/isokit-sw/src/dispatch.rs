//! Fetch interception: the one place that decides how a request is answered.
//!
//! ```text
//! Range header ─► RangeFlow: fetch full (Range stripped) ─► slice ─► 206
//!                            ├─ malformed header ─► full response
//!                            └─ out of bounds ─► 416
//! no Range ─► CacheFlow: match ─► hit ─► rewrite
//!                              └► miss ─► fetch ─► rewrite
//!                                             └─► spawn cache write
//! ```
//!
//! Every response that leaves the dispatcher has passed through the
//! [`ResponseRewriter`] exactly once.

use std::sync::Arc;

use http::header::{CONTENT_TYPE, RANGE};
use http::{HeaderValue, Method};
use isokit_net::{Fetcher, Request, Response};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::cache::Cache;
use crate::range::{self, ByteRange, RangeError};
use crate::rewrite::ResponseRewriter;
use crate::{ServiceWorkerError, ServiceWorkerEvent};

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Served from the cache bucket.
    CacheHit,
    /// Fetched from the network after a cache miss.
    Network,
    /// Range request answered with a 206 slice.
    Partial,
    /// Range header could not be parsed; full response returned.
    RangeIgnored,
    /// Range outside the resource; 416 returned.
    RangeNotSatisfiable,
    /// Range request whose upstream answer was not a 2xx; returned as is.
    RangeUpstreamError,
    /// Worker not controlling the request; network response untouched.
    Uncontrolled,
}

/// A response plus the route that produced it.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: Response,
    pub route: Route,
}

impl FetchOutcome {
    fn new(response: Response, route: Route) -> Self {
        Self { response, route }
    }
}

/// Per-request decision tree over the cache, the network and the rewriter.
pub struct FetchDispatcher {
    cache: Cache,
    fetcher: Arc<dyn Fetcher>,
    rewriter: ResponseRewriter,
    writes: TaskTracker,
    events: Option<mpsc::UnboundedSender<ServiceWorkerEvent>>,
}

impl FetchDispatcher {
    /// Dispatcher applying the cross-origin isolation headers.
    pub fn new(cache: Cache, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache,
            fetcher,
            rewriter: ResponseRewriter::cross_origin_isolation(),
            writes: TaskTracker::new(),
            events: None,
        }
    }

    pub fn with_rewriter(mut self, rewriter: ResponseRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Publish swallowed cache-write failures on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Answer one request.
    ///
    /// Network failures on the response path are returned as errors. Cache
    /// write failures never are.
    pub async fn dispatch(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        match request.headers.get(RANGE).cloned() {
            Some(range) => self.range_flow(request, range).await,
            None => self.cache_flow(request).await,
        }
    }

    async fn cache_flow(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        if let Some(cached) = self.cache.match_request(&request).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(FetchOutcome::new(self.rewriter.rewrite(&cached), Route::CacheHit));
        }

        debug!(url = %request.url, method = %request.method, "Cache miss, fetching");
        let store_as = (request.method == Method::GET).then(|| request.clone());
        let response = self.fetcher.fetch(request).await?;

        if let Some(key) = store_as {
            self.spawn_cache_write(key, response.clone());
        }

        Ok(FetchOutcome::new(self.rewriter.rewrite(&response), Route::Network))
    }

    async fn range_flow(
        &self,
        request: Request,
        range: HeaderValue,
    ) -> Result<FetchOutcome, ServiceWorkerError> {
        let parsed = range
            .to_str()
            .map_err(|_| RangeError::Malformed(String::from_utf8_lossy(range.as_bytes()).into_owned()))
            .and_then(ByteRange::parse);

        // The origin must send the whole representation; slicing a 206 would be wrong
        let upstream = request.without_header(&RANGE);
        let url = upstream.url.clone();
        let response = self.fetcher.fetch(upstream).await?;

        if !response.ok() {
            debug!(url = %url, status = %response.status(), "Range request upstream error");
            return Ok(FetchOutcome::new(
                self.rewriter.rewrite(&response),
                Route::RangeUpstreamError,
            ));
        }

        let range = match parsed {
            Ok(range) => range,
            Err(error) => {
                debug!(url = %url, error = %error, "Ignoring range header");
                return Ok(FetchOutcome::new(
                    self.rewriter.rewrite(&response),
                    Route::RangeIgnored,
                ));
            }
        };

        match range::slice(response.body(), range, response.headers().get(CONTENT_TYPE)) {
            Ok(partial) => {
                trace!(
                    url = %url,
                    content_range = partial.header("content-range").unwrap_or_default(),
                    "Serving partial content"
                );
                Ok(FetchOutcome::new(self.rewriter.rewrite(&partial), Route::Partial))
            }
            Err(error @ RangeError::Unsatisfiable { .. }) => {
                debug!(url = %url, error = %error, "Range not satisfiable");
                let refused = range::not_satisfiable(response.body().len() as u64)?;
                Ok(FetchOutcome::new(
                    self.rewriter.rewrite(&refused),
                    Route::RangeNotSatisfiable,
                ))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Store a network response in the background.
    ///
    /// The task is never awaited on the response path; a failure is logged
    /// and published, then dropped.
    fn spawn_cache_write(&self, request: Request, response: Response) {
        let cache = self.cache.clone();
        let events = self.events.clone();

        self.writes.spawn(async move {
            let url = request.url.to_string();
            match cache.put(&request, response).await {
                Ok(()) => trace!(url = %url, "Stored network response"),
                Err(error) => {
                    warn!(url = %url, error = %error, "Cache write failed");
                    if let Some(events) = events {
                        let _ = events.send(ServiceWorkerEvent::CacheWriteFailed {
                            url,
                            error: error.to_string(),
                        });
                    }
                }
            }
        });
    }

    /// Number of background cache writes still running.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Wait for every background cache write spawned so far.
    pub async fn settle(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }
}
