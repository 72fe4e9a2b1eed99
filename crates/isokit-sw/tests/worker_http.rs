//! End-to-end worker tests against a mock HTTP origin.

use std::sync::Arc;

use http::header::RANGE;
use http::{HeaderValue, StatusCode};
use isokit_net::{LoaderConfig, Request, ResourceLoader};
use isokit_sw::{
    FetchEvent, Route, ServiceWorker, ServiceWorkerError, ServiceWorkerState, WorkerConfig,
};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_page(server: &MockServer, route: &str, body: &str, hits: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(body),
        )
        .expect(hits)
        .mount(server)
        .await;
}

async fn worker_for(server: &MockServer) -> (Arc<ServiceWorker>, WorkerConfig) {
    let config = WorkerConfig::new(Url::parse(&server.uri()).unwrap());
    let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
    let (worker, _events) = ServiceWorker::new(config.clone(), &config.cache_storage(), Arc::new(loader))
        .await
        .unwrap();
    (Arc::new(worker), config)
}

#[tokio::test]
async fn test_install_caches_manifest_over_http() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "<html>root</html>", 1).await;
    mount_page(&server, "/index.html", "<html>index</html>", 1).await;

    let (worker, _config) = worker_for(&server).await;
    let report = worker.install().await.unwrap();

    assert_eq!(report.entries, 2);
    assert_eq!(worker.cache().len().await, 2);
    assert_eq!(worker.state().await, ServiceWorkerState::Activated);
}

#[tokio::test]
async fn test_install_failure_over_http_stores_nothing() {
    let server = MockServer::start().await;
    // The root fetch may be abandoned once the failure is seen
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>root</html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (worker, _config) = worker_for(&server).await;
    let err = worker.install().await.unwrap_err();

    assert!(matches!(err, ServiceWorkerError::PrecacheFailed(_)));
    assert_eq!(worker.cache().len().await, 0);
    assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
}

#[tokio::test]
async fn test_precached_page_served_without_network() {
    let server = MockServer::start().await;
    // Fetched once by install, never again
    mount_page(&server, "/", "<html>root</html>", 1).await;
    mount_page(&server, "/index.html", "<html>index</html>", 1).await;

    let (worker, config) = worker_for(&server).await;
    worker.install().await.unwrap();

    let (event, reply) = FetchEvent::new(Request::get(config.resolve("/").unwrap()));
    worker.dispatch_event(event);
    let outcome = reply.await.unwrap().unwrap();

    assert_eq!(outcome.route, Route::CacheHit);
    assert_eq!(outcome.response.body().as_ref(), b"<html>root</html>");
    assert_eq!(outcome.response.header("content-type"), Some("text/html"));
    assert_eq!(outcome.response.header("cross-origin-opener-policy"), Some("same-origin"));
    assert_eq!(outcome.response.header("cross-origin-embedder-policy"), Some("require-corp"));
}

#[tokio::test]
async fn test_range_request_over_http() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "root", 1).await;
    mount_page(&server, "/index.html", "index", 1).await;
    let video: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/movie.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp4")
                .set_body_bytes(video.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (worker, config) = worker_for(&server).await;
    worker.install().await.unwrap();

    let request = Request::get(config.resolve("/movie.mp4").unwrap())
        .header(RANGE, HeaderValue::from_static("bytes=0-99"));
    let outcome = worker.handle_fetch(request).await.unwrap();

    assert_eq!(outcome.route, Route::Partial);
    assert_eq!(outcome.response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(outcome.response.header("content-range"), Some("bytes 0-99/1000"));
    assert_eq!(outcome.response.header("content-type"), Some("video/mp4"));
    assert_eq!(outcome.response.body().as_ref(), &video[..100]);
    assert_eq!(outcome.response.header("cross-origin-embedder-policy"), Some("require-corp"));

    let received = server.received_requests().await.unwrap();
    let upstream = received
        .iter()
        .find(|r| r.url.path() == "/movie.mp4")
        .unwrap();
    assert!(upstream.headers.get("range").is_none());
}

#[tokio::test]
async fn test_network_response_cached_after_settle() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "root", 1).await;
    mount_page(&server, "/index.html", "index", 1).await;
    mount_page(&server, "/about.html", "<p>about</p>", 1).await;

    let (worker, config) = worker_for(&server).await;
    worker.install().await.unwrap();

    let about = config.resolve("/about.html").unwrap();
    let first = worker.handle_fetch(Request::get(about.clone())).await.unwrap();
    assert_eq!(first.route, Route::Network);

    worker.dispatcher().settle().await;
    let second = worker.handle_fetch(Request::get(about)).await.unwrap();
    assert_eq!(second.route, Route::CacheHit);
    assert_eq!(second.response.body().as_ref(), b"<p>about</p>");
}
