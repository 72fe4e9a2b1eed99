//! In-memory [`Fetcher`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use http::StatusCode;
use isokit_net::{Fetcher, NetError, Request, Response};
use url::Url;

pub(crate) const ORIGIN: &str = "https://example.com";

pub(crate) fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Serves canned responses by URL; unknown URLs answer 404.
#[derive(Default)]
pub(crate) struct StubFetcher {
    resources: HashMap<String, Response>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    requests: Mutex<Vec<Request>>,
}

impl StubFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, path: &str, response: Response) -> Self {
        self.resources.insert(url(path).to_string(), response);
        self
    }

    /// Requests for `path` fail with a network error.
    pub(crate) fn failing(mut self, path: &str) -> Self {
        self.failing.insert(url(path).to_string());
        self
    }

    /// Requests for `path` never complete.
    pub(crate) fn hanging(mut self, path: &str) -> Self {
        self.hanging.insert(url(path).to_string());
        self
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.requests.lock().unwrap().push(request.clone());
        let key = request.url.to_string();

        if self.hanging.contains(&key) {
            futures::future::pending::<()>().await;
        }
        if self.failing.contains(&key) {
            return Err(NetError::RequestFailed(format!("connection reset: {key}")));
        }

        Ok(match self.resources.get(&key) {
            Some(response) => response.clone().with_url(request.url),
            None => Response::new(StatusCode::NOT_FOUND, "").with_url(request.url),
        })
    }
}
