//! # Axum Adapter
//!
//! Bridges the gate into an axum router via
//! `axum::middleware::from_fn_with_state`. The adapter buffers the body
//! up to the configured ceiling, converts the request into the gate's
//! own type, short-circuits with the rejection response, or forwards to
//! the inner handler and finishes with response annotation and audit
//! finalization.
//!
//! Handlers can read the admitted [`RequestContext`] from the request
//! extensions, for example to require an authenticated caller.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::core::error::SentinelError;
use crate::core::types::{IncomingRequest, RequestContext};
use crate::middleware::pipeline::{GateDecision, RequestGate};

/// Fallback address when the host did not register connect info.
const UNKNOWN_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

/// Run the full gate around an axum handler.
///
/// Install with:
/// ```ignore
/// Router::new()
///     .route("/api/convert", post(convert))
///     .layer(axum::middleware::from_fn_with_state(gate, sentinel_middleware))
/// ```
pub async fn sentinel_middleware(
    State(gate): State<Arc<RequestGate>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or(UNKNOWN_ADDR);

    // Buffer up to one byte past the ceiling: an overrun is reported
    // through the same rejection and audit path as any stage veto.
    let limit = usize::try_from(gate.max_body_bytes().saturating_add(1)).unwrap_or(usize::MAX);
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, path = %parts.uri.path(), "Failed to buffer request body");
            let incoming = IncomingRequest::new(
                parts.method.clone(),
                parts.uri.clone(),
                parts.headers.clone(),
                Vec::new(),
                remote_addr,
            );
            let rejection = gate.reject(
                incoming,
                SentinelError::validation(
                    "body".to_string(),
                    format!(
                        "payload could not be read within the {} byte limit",
                        gate.max_body_bytes()
                    ),
                ),
            );
            return rejection.into_response();
        }
    };

    let incoming = IncomingRequest::new(
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        bytes.to_vec(),
        remote_addr,
    );

    match gate.admit(incoming).await {
        GateDecision::Rejected(response) => response.into_response(),
        GateDecision::Admitted(ctx) => {
            let mut request = Request::from_parts(parts, Body::from(bytes));
            request.extensions_mut().insert(Arc::new(ctx.clone()));

            let mut response = next.run(request).await;
            let status = response.status();
            gate.complete(ctx, status, response.headers_mut());
            response
        }
    }
}

/// Extension lookup helper for handlers that care about the gate's
/// verdicts (caller identity, health-data marking).
pub fn request_context(request: &Request) -> Option<Arc<RequestContext>> {
    request.extensions().get::<Arc<RequestContext>>().cloned()
}
