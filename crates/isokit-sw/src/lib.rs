//! # IsoKit Service Worker
//!
//! A request-interception layer that serves a site from a single named cache
//! bucket and makes every response it hands back cross-origin isolated.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache), skip waiting, activate
//! - **Cache API**: `open`, `match`, `put`, `addAll` over one bucket
//! - **Header rewriting**: `Cross-Origin-Opener-Policy: same-origin` and
//!   `Cross-Origin-Embedder-Policy: require-corp` on every response
//! - **Range requests**: single `bytes=` ranges answered with 206 slices
//!
//! ## Architecture
//!
//! ```text
//! FetchEvent ──► ServiceWorker::dispatch_event
//!                    │
//!                    └── FetchDispatcher (one per worker)
//!                            ├── Range header? ── fetch full ── slice ── 206
//!                            └── no Range ── Cache::match_request
//!                                              ├── hit  ── rewrite
//!                                              └── miss ── fetch ── rewrite
//!                                                             └── background Cache::put
//! ```

use isokit_common::IsoKitError;
use isokit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod range;
pub mod rewrite;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, CacheError, CacheKey, CacheStorage};
pub use config::{WorkerConfig, DEFAULT_CACHE_NAME, DEFAULT_PRECACHE};
pub use dispatch::{FetchDispatcher, FetchOutcome, Route};
pub use range::{ByteRange, RangeError, ResolvedRange};
pub use rewrite::{
    ResponseRewriter, CROSS_ORIGIN_EMBEDDER_POLICY, CROSS_ORIGIN_OPENER_POLICY,
};
pub use worker::{
    FetchEvent, FetchReply, InstallReport, ServiceWorker, ServiceWorkerId, ServiceWorkerState,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache failed: {0}")]
    PrecacheFailed(#[source] CacheError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Range error: {0}")]
    Range(#[from] RangeError),

    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Config(#[from] IsoKitError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ServiceWorkerError {
    /// Whether trying the same operation again later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceWorkerError::PrecacheFailed(_) | ServiceWorkerError::Network(_)
        )
    }
}

// ==================== Events ====================

/// Notifications published by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// Lifecycle state changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A background cache write failed. The response it belonged to was
    /// delivered regardless.
    CacheWriteFailed { url: String, error: String },
}
