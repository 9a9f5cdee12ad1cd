//! # Core Types Module
//!
//! Foundational data structures shared by every pipeline stage: the unified
//! incoming request, the mutable per-request context that flows through the
//! stages, the sentinel's own response type for rejections, and the audit
//! record emitted once per request.

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::error::SentinelError;

/// An incoming HTTP request after buffering, before any defense decision.
///
/// All stages inspect the same immutable view. The body lives behind an
/// `Arc` so cloning the request for the context never copies large payloads.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (for tracing and audit)
    pub id: String,

    /// HTTP method (GET, POST, etc.)
    pub method: Method,

    /// Request URI including path and query parameters
    pub uri: Uri,

    /// Request headers
    pub headers: HeaderMap,

    /// Buffered request body
    pub body: Arc<Vec<u8>>,

    /// Client's remote address as seen at the socket
    pub remote_addr: SocketAddr,

    /// Whether the request arrived over a TLS connection. Proxied
    /// deployments usually leave this false and rely on the forwarded
    /// protocol header instead.
    pub secure: bool,

    /// Path parameters extracted by the host router (e.g. `{"id": "42"}`)
    pub path_params: HashMap<String, String>,

    /// Timestamp when the request was received
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Create a new incoming request with a generated ID.
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Vec<u8>,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            headers,
            body: Arc::new(body),
            remote_addr,
            secure: false,
            path_params: HashMap::new(),
            received_at: Instant::now(),
        }
    }

    /// Mark the request as having arrived over TLS.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Attach path parameters extracted by the host router.
    pub fn with_path_params(mut self, params: HashMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    /// Get the request path without query parameters.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get the raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Get the declared content length, if the header parses.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.parse().ok())
    }

    /// Get the client IP as a string, without the port.
    pub fn client_ip(&self) -> String {
        self.remote_addr.ip().to_string()
    }

    /// Get the user agent header, or an empty string.
    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }
}

/// Authenticated caller identity attached to the context by the API key
/// stage. A flattened snapshot of the key and its owning application,
/// not a live handle into the key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Identifier of the API key record
    pub key_id: String,

    /// Identifier of the owning application
    pub application_id: String,

    /// Display name of the owning application
    pub application_name: String,

    /// Origins this application may send browser requests from
    pub allowed_origins: Vec<String>,

    /// Total successful uses of the key, including this request
    pub usage_count: u64,
}

/// Outcome of a rate-limit check for an admitted request, used to stamp
/// the `x-ratelimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Ceiling for the window this request was counted against
    pub limit: u32,

    /// Requests left in the window after this one
    pub remaining: u32,

    /// Unix timestamp (seconds) when the window resets
    pub reset_at: u64,

    /// True when the route is exempt from limiting (health checks)
    pub exempt: bool,
}

/// One privacy-preserving audit entry per request.
///
/// Contains no raw network identity: the client field is anonymized and
/// the session field is a truncated daily hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the request entered the pipeline
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Correlates with the request ID used in stage logs
    pub request_id: String,

    /// HTTP method
    pub method: String,

    /// Request path (no query string)
    pub path: String,

    /// Anonymized client address
    pub client: String,

    /// Truncated daily session hash
    pub session: String,

    /// Caller's user agent
    pub user_agent: String,

    /// Final response status, 0 until finalized
    pub status: u16,

    /// Total processing time in milliseconds
    pub duration_ms: u64,

    /// True when the final status is below 400
    pub success: bool,

    /// True when the route handles health data
    pub health_data: bool,
}

/// Per-request context threaded through the pipeline stages.
///
/// Stages read the shared request and record their verdicts here; the
/// orchestrator uses those verdicts to annotate and audit the response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The request under evaluation
    pub request: Arc<IncomingRequest>,

    /// Caller identity, populated by the API key stage when a valid key
    /// is presented; `None` means anonymous
    pub auth: Option<Arc<AuthContext>>,

    /// True when the request targets a route that serves health data
    pub health_data: bool,

    /// Rate-limit outcome, populated once the limiter has counted the
    /// request
    pub rate_limit: Option<RateLimitDecision>,

    /// Audit record started at admission, consumed at finalization
    pub audit: Option<AuditRecord>,

    /// Request start time for latency measurement
    pub start_time: Instant,
}

impl RequestContext {
    /// Create a new context for a request entering the pipeline.
    pub fn new(request: Arc<IncomingRequest>) -> Self {
        Self {
            request,
            auth: None,
            health_data: false,
            rate_limit: None,
            audit: None,
            start_time: Instant::now(),
        }
    }

    /// Get elapsed time since the request entered the pipeline.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Attach the authenticated caller identity.
    pub fn set_auth(&mut self, auth: AuthContext) {
        self.auth = Some(Arc::new(auth));
    }

    /// Whether a valid API key was presented.
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }
}

/// Response produced by the sentinel itself, used for rejections.
#[derive(Debug, Clone)]
pub struct SentinelResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Arc<Vec<u8>>,
}

impl SentinelResponse {
    /// Create a new response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body: Arc::new(body),
        }
    }

    /// Create a simple text response.
    pub fn text(status: StatusCode, text: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            axum::http::HeaderValue::from_static("text/plain"),
        );
        Self::new(status, headers, text.into_bytes())
    }

    /// Create a JSON response.
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            axum::http::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status, headers, body))
    }

    /// Build the rejection response for a pipeline error, including the
    /// back-off headers for rate-limit rejections.
    pub fn from_error(err: &SentinelError) -> Self {
        let mut response = Self::json(err.status_code(), &err.rejection_body())
            .unwrap_or_else(|_| {
                Self::text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            });

        if let SentinelError::RateLimitExceeded {
            limit,
            retry_after_secs,
            reset_at,
        } = err
        {
            let headers = &mut response.headers;
            if let Ok(value) = retry_after_secs.to_string().parse() {
                headers.insert("retry-after", value);
            }
            if let Ok(value) = limit.to_string().parse() {
                headers.insert("x-ratelimit-limit", value);
            }
            headers.insert(
                "x-ratelimit-remaining",
                axum::http::HeaderValue::from_static("0"),
            );
            if let Ok(value) = reset_at.to_string().parse() {
                headers.insert("x-ratelimit-reset", value);
            }
        }

        response
    }
}

impl IntoResponse for SentinelResponse {
    fn into_response(self) -> axum::response::Response {
        let body = axum::body::Body::from(self.body.as_ref().clone());
        let mut response = axum::response::Response::new(body);
        *response.status_mut() = self.status;
        response.headers_mut().extend(self.headers);
        response
    }
}
