//! Worker lifecycle and fetch event handling.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use isokit_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheStorage};
use crate::config::WorkerConfig;
use crate::dispatch::{FetchDispatcher, FetchOutcome, Route};
use crate::{ServiceWorkerError, ServiceWorkerEvent};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installed.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Precache complete.
    Installed,
    /// Taking control.
    Activating,
    /// Controlling fetches.
    Activated,
    /// Install failed; this worker never activates.
    Redundant,
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub worker_id: ServiceWorkerId,
    pub cache_name: String,
    pub entries: usize,
}

// ==================== Fetch Events ====================

/// Receiving half of a [`FetchEvent`]. Dropping it cancels the request.
pub type FetchReply = oneshot::Receiver<Result<FetchOutcome, ServiceWorkerError>>;

/// One intercepted request awaiting an answer.
///
/// `respond_with` takes the event by value, so an event is answered at most
/// once.
#[derive(Debug)]
pub struct FetchEvent {
    request: Request,
    responder: oneshot::Sender<Result<FetchOutcome, ServiceWorkerError>>,
}

impl FetchEvent {
    pub fn new(request: Request) -> (Self, FetchReply) {
        let (responder, reply) = oneshot::channel();
        (Self { request, responder }, reply)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Whether the requester has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.responder.is_closed()
    }

    /// Deliver the answer. Returns `false` if the requester already left.
    pub fn respond_with(self, result: Result<FetchOutcome, ServiceWorkerError>) -> bool {
        self.responder.send(result).is_ok()
    }
}

// ==================== Service Worker ====================

/// A single worker version bound to one cache bucket.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: WorkerConfig,
    state: RwLock<ServiceWorkerState>,
    fetcher: Arc<dyn Fetcher>,
    dispatcher: FetchDispatcher,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker in the `Parsed` state, opening its bucket in `storage`.
    pub async fn new(
        config: WorkerConfig,
        storage: &CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cache = storage.open(&config.cache_name).await;
        let dispatcher =
            FetchDispatcher::new(cache, Arc::clone(&fetcher)).with_events(event_tx.clone());

        let worker = Self {
            id: ServiceWorkerId::new(),
            config,
            state: RwLock::new(ServiceWorkerState::Parsed),
            fetcher,
            dispatcher,
            event_tx,
        };
        debug!(worker = worker.id.raw(), cache = %worker.config.cache_name, "Created service worker");

        Ok((worker, event_rx))
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == ServiceWorkerState::Activated
    }

    pub fn cache(&self) -> &Cache {
        self.dispatcher.cache()
    }

    pub fn dispatcher(&self) -> &FetchDispatcher {
        &self.dispatcher
    }

    /// Precache the manifest, then skip waiting and activate.
    ///
    /// On failure the bucket is left as it was and the worker becomes
    /// `Redundant`; a retry needs a fresh worker.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        {
            let mut state = self.state.write().await;
            if *state != ServiceWorkerState::Parsed {
                return Err(ServiceWorkerError::StateError(format!(
                    "cannot install a worker that is {}",
                    *state
                )));
            }
            *state = ServiceWorkerState::Installing;
        }
        self.publish(ServiceWorkerState::Installing);

        let urls = match self.config.precache_urls() {
            Ok(urls) => urls,
            Err(e) => {
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(e.into());
            }
        };

        let entries = match self.cache().add_all(self.fetcher.as_ref(), &urls).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(worker = self.id.raw(), error = %e, "Install failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(ServiceWorkerError::PrecacheFailed(e));
            }
        };
        self.set_state(ServiceWorkerState::Installed).await;

        // Skip waiting: there is never an older worker to wait for
        self.set_state(ServiceWorkerState::Activating).await;
        self.set_state(ServiceWorkerState::Activated).await;

        info!(
            worker = self.id.raw(),
            cache = %self.config.cache_name,
            entries,
            "Service worker activated"
        );
        Ok(InstallReport {
            worker_id: self.id,
            cache_name: self.config.cache_name.clone(),
            entries,
        })
    }

    /// Answer a request directly.
    ///
    /// Before activation the request goes to the network untouched.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        if !self.is_active().await {
            debug!(url = %request.url, "Worker not active, passing through");
            let response = self.fetcher.fetch(request).await?;
            return Ok(FetchOutcome {
                response,
                route: Route::Uncontrolled,
            });
        }

        let url = request.url.clone();
        let outcome = self.dispatcher.dispatch(request).await?;
        debug!(url = %url, route = ?outcome.route, status = %outcome.response.status(), "Fetch handled");
        Ok(outcome)
    }

    /// Handle `event` on its own task.
    ///
    /// If the requester drops its [`FetchReply`] first, the in-flight work
    /// is abandoned. Background cache writes already spawned keep running.
    pub fn dispatch_event(self: &Arc<Self>, mut event: FetchEvent) -> JoinHandle<()> {
        let worker = Arc::clone(self);

        tokio::spawn(async move {
            let url = event.request.url.clone();
            let result = tokio::select! {
                result = worker.handle_fetch(event.request.clone()) => Some(result),
                _ = event.responder.closed() => None,
            };

            match result {
                Some(result) => {
                    if !event.respond_with(result) {
                        debug!(url = %url, "Requester left before the response was delivered");
                    }
                }
                None => debug!(url = %url, "Fetch cancelled by requester"),
            }
        })
    }

    async fn set_state(&self, new_state: ServiceWorkerState) {
        *self.state.write().await = new_state;
        self.publish(new_state);
    }

    fn publish(&self, new_state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), state = %new_state, "State change");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::CROSS_ORIGIN_OPENER_POLICY;
    use crate::testing::{url, StubFetcher, ORIGIN};
    use http::StatusCode;
    use isokit_net::Response;
    use std::time::Duration;
    use url::Url;

    fn config() -> WorkerConfig {
        WorkerConfig::new(Url::parse(ORIGIN).unwrap())
    }

    fn site() -> StubFetcher {
        StubFetcher::new()
            .with("/", Response::new(StatusCode::OK, "<html>root</html>"))
            .with("/index.html", Response::new(StatusCode::OK, "<html>index</html>"))
    }

    async fn worker(
        fetcher: StubFetcher,
    ) -> (Arc<ServiceWorker>, mpsc::UnboundedReceiver<ServiceWorkerEvent>, CacheStorage) {
        let storage = CacheStorage::new();
        let (worker, events) = ServiceWorker::new(config(), &storage, Arc::new(fetcher))
            .await
            .unwrap();
        (Arc::new(worker), events, storage)
    }

    fn drain_states(events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_install_precaches_and_activates() {
        let (worker, mut events, storage) = worker(site()).await;

        let report = worker.install().await.unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(report.cache_name, "my-site-cache-v1");
        assert_eq!(worker.cache().len().await, 2);
        assert!(storage.has("my-site-cache-v1").await);
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);
        assert_eq!(
            drain_states(&mut events),
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_install_failure_leaves_bucket_empty() {
        let fetcher = StubFetcher::new()
            .with("/", Response::new(StatusCode::OK, "root"))
            .failing("/index.html");
        let (worker, mut events, _storage) = worker(fetcher).await;

        let err = worker.install().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::PrecacheFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(worker.cache().len().await, 0);
        assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
        assert_eq!(
            drain_states(&mut events),
            vec![ServiceWorkerState::Installing, ServiceWorkerState::Redundant]
        );
    }

    #[tokio::test]
    async fn test_install_fails_on_missing_manifest_entry() {
        let fetcher = StubFetcher::new().with("/", Response::new(StatusCode::OK, "root"));
        let (worker, _events, _storage) = worker(fetcher).await;

        assert!(worker.install().await.is_err());
        assert!(worker.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_install_twice_is_a_state_error() {
        let (worker, _events, _storage) = worker(site()).await;
        worker.install().await.unwrap();

        let err = worker.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.cache_name = "  ".to_string();

        let result = ServiceWorker::new(config, &CacheStorage::new(), Arc::new(site())).await;
        assert!(matches!(result, Err(ServiceWorkerError::Config(_))));
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_passes_through() {
        let (worker, _events, _storage) = worker(site()).await;

        let outcome = worker.handle_fetch(Request::get(url("/"))).await.unwrap();

        assert_eq!(outcome.route, Route::Uncontrolled);
        assert!(outcome.response.headers().get(CROSS_ORIGIN_OPENER_POLICY).is_none());
        worker.dispatcher().settle().await;
        assert!(worker.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_active_worker_serves_from_cache() {
        let (worker, _events, _storage) = worker(site()).await;
        worker.install().await.unwrap();

        let outcome = worker.handle_fetch(Request::get(url("/index.html"))).await.unwrap();

        assert_eq!(outcome.route, Route::CacheHit);
        assert_eq!(outcome.response.body().as_ref(), b"<html>index</html>");
        assert_eq!(outcome.response.header("cross-origin-embedder-policy"), Some("require-corp"));
    }

    #[tokio::test]
    async fn test_dispatch_event_delivers_reply() {
        let (worker, _events, _storage) = worker(site()).await;
        worker.install().await.unwrap();

        let (event, reply) = FetchEvent::new(Request::get(url("/")));
        worker.dispatch_event(event).await.unwrap();

        let outcome = reply.await.unwrap().unwrap();
        assert_eq!(outcome.route, Route::CacheHit);
    }

    #[tokio::test]
    async fn test_dispatch_event_reports_network_error() {
        let (worker, _events, _storage) = worker(site().failing("/api")).await;
        worker.install().await.unwrap();

        let (event, reply) = FetchEvent::new(Request::get(url("/api")));
        worker.dispatch_event(event);

        let result = reply.await.unwrap();
        assert!(matches!(result, Err(ServiceWorkerError::Network(_))));
    }

    #[tokio::test]
    async fn test_dropped_reply_cancels_in_flight_fetch() {
        let (worker, _events, _storage) = worker(site().hanging("/slow")).await;
        worker.install().await.unwrap();

        let (event, reply) = FetchEvent::new(Request::get(url("/slow")));
        let handle = worker.dispatch_event(event);
        drop(reply);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("handler should stop once the requester leaves")
            .unwrap();
    }

    #[tokio::test]
    async fn test_respond_with_after_requester_left() {
        let (event, reply) = FetchEvent::new(Request::get(url("/")));
        assert!(!event.is_cancelled());
        drop(reply);
        assert!(event.is_cancelled());

        let outcome = FetchOutcome {
            response: Response::new(StatusCode::OK, "late"),
            route: Route::Network,
        };
        assert!(!event.respond_with(Ok(outcome)));
    }

    #[tokio::test]
    async fn test_reply_dropped_after_fetch_still_caches() {
        let fresh = Response::new(StatusCode::OK, "<p>fresh</p>");
        let (worker, _events, _storage) = worker(site().with("/fresh.html", fresh)).await;
        worker.install().await.unwrap();

        let request = Request::get(url("/fresh.html"));
        let (event, reply) = FetchEvent::new(request.clone());
        let outcome = worker.handle_fetch(event.request().clone()).await.unwrap();
        assert_eq!(outcome.route, Route::Network);

        drop(reply);
        assert!(!event.respond_with(Ok(outcome)));

        worker.dispatcher().settle().await;
        let cached = worker.cache().match_request(&request).await.unwrap();
        assert_eq!(cached.body().as_ref(), b"<p>fresh</p>");
    }

    #[tokio::test]
    async fn test_unread_reply_does_not_lose_cache_write() {
        let fresh = Response::new(StatusCode::OK, "<p>fresh</p>");
        let (worker, _events, _storage) = worker(site().with("/fresh.html", fresh)).await;
        worker.install().await.unwrap();

        let request = Request::get(url("/fresh.html"));
        let (event, reply) = FetchEvent::new(request.clone());
        worker.dispatch_event(event).await.unwrap();
        drop(reply);

        worker.dispatcher().settle().await;
        assert!(worker.cache().match_request(&request).await.is_some());
    }

    #[test]
    fn test_state_display_and_ids() {
        assert_eq!(ServiceWorkerState::default(), ServiceWorkerState::Parsed);
        assert_eq!(ServiceWorkerState::Activated.to_string(), "activated");
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }
}
