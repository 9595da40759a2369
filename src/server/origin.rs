//! Origin allow-list for the local service.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

const EXTENSION_SCHEME: &str = "chrome-extension://";

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: origins
                .into_iter()
                .map(|o| o.into().trim_end_matches('/').to_string())
                .collect(),
        }
    }

    /// Requests without an `Origin` header come from local tools and pass.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None | Some("") => true,
            Some(origin) => origin.starts_with(EXTENSION_SCHEME) || self.allowed.contains(origin),
        }
    }

    pub fn cors_layer(self: &Arc<Self>) -> CorsLayer {
        let policy = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                origin
                    .to_str()
                    .map(|o| policy.is_allowed(Some(o)))
                    .unwrap_or(false)
            }))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE])
    }
}

/// Reject requests from origins outside the allow-list.
pub async fn guard(
    State(policy): State<Arc<OriginPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .map(|v| v.to_str().unwrap_or("\u{fffd}"));
    if !policy.is_allowed(origin) {
        tracing::warn!(
            target: "security",
            "Blocked request from unauthorized origin: {}",
            origin.unwrap_or_default()
        );
        return (StatusCode::FORBIDDEN, "Forbidden: Origin not allowed").into_response();
    }
    next.run(request).await
}
