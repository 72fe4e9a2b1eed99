//! Response rewriting.
//!
//! Responses are never edited in place. The rewriter copies the header set,
//! applies its overrides and builds a new [`Response`] around the same body.

use http::{HeaderMap, HeaderName, HeaderValue};
use isokit_net::Response;

pub const CROSS_ORIGIN_OPENER_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-opener-policy");

pub const CROSS_ORIGIN_EMBEDDER_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-embedder-policy");

/// Produces copies of responses with a fixed set of header overrides.
#[derive(Debug, Clone)]
pub struct ResponseRewriter {
    overrides: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseRewriter {
    /// A rewriter with no overrides.
    pub fn new() -> Self {
        Self {
            overrides: Vec::new(),
        }
    }

    /// `Cross-Origin-Opener-Policy: same-origin` and
    /// `Cross-Origin-Embedder-Policy: require-corp`.
    pub fn cross_origin_isolation() -> Self {
        Self::new()
            .with_override(
                CROSS_ORIGIN_OPENER_POLICY,
                HeaderValue::from_static("same-origin"),
            )
            .with_override(
                CROSS_ORIGIN_EMBEDDER_POLICY,
                HeaderValue::from_static("require-corp"),
            )
    }

    /// Add an override. A later override for the same header replaces the earlier one.
    pub fn with_override(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.overrides.retain(|(existing, _)| *existing != name);
        self.overrides.push((name, value));
        self
    }

    pub fn overrides(&self) -> &[(HeaderName, HeaderValue)] {
        &self.overrides
    }

    /// Set every override on a header map the caller owns.
    ///
    /// `insert` drops all prior values for the name, so an upstream value
    /// never survives next to the override.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.overrides {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Build a new response: same body, status and status text, headers
    /// plus overrides.
    pub fn rewrite(&self, response: &Response) -> Response {
        let mut headers = response.headers().clone();
        self.apply(&mut headers);
        response.derive_with_headers(headers)
    }
}

impl Default for ResponseRewriter {
    fn default() -> Self {
        Self::cross_origin_isolation()
    }
}
