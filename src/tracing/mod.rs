//! Request correlation for logs and error bodies.
//!
//! The request id is taken from `x-request-id` (generated by the request-id
//! layer when the client sent none) and kept in a task-local so that error
//! responses built deep inside a handler can echo it.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use metrics::{counter, histogram};
use std::{cell::RefCell, fmt, future::Future, time::Instant};
use tower_http::trace::MakeSpan;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID tracking information
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

impl Default for RequestId {
    fn default() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }
}

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        RequestId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_request<B>(request: &http::Request<B>) -> Self {
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(RequestId::new)
            .unwrap_or_default()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

tokio::task_local! {
    static CURRENT_REQUEST_ID: RefCell<Option<RequestId>>;
}

pub async fn scope_request_id<Fut, R>(request_id: RequestId, future: Fut) -> R
where
    Fut: Future<Output = R>,
{
    CURRENT_REQUEST_ID
        .scope(RefCell::new(Some(request_id)), future)
        .await
}

pub fn current_request_id() -> Option<RequestId> {
    CURRENT_REQUEST_ID
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

/// Span factory for `TraceLayer` carrying the request id.
#[derive(Clone, Default)]
pub struct RequestSpanMaker;

impl<B> MakeSpan<B> for RequestSpanMaker {
    fn make_span(&mut self, request: &http::Request<B>) -> tracing::Span {
        let request_id = RequestId::from_request(request);
        tracing::info_span!(
            "http.request",
            request_id = %request_id.as_str(),
            method = %request.method(),
            uri = %request.uri(),
        )
    }
}

/// Middleware scoping the request id for the handler and recording request metrics.
pub async fn request_context(request: Request<Body>, next: Next) -> Response {
    let request_id = RequestId::from_request(&request);
    let method = request.method().to_string();
    let start = Instant::now();

    let response = scope_request_id(request_id, next.run(request)).await;

    let status = response.status().as_u16().to_string();
    counter!("http_requests_total", 1, "method" => method.clone(), "status" => status);
    histogram!(
        "http_request_duration_seconds",
        start.elapsed().as_secs_f64(),
        "method" => method
    );
    response
}
