//! # API Sentinel - Request Defense and Compliance Pipeline
//!
//! A library of composable HTTP request middleware for health-data APIs.
//! An ordered chain of stages authenticates callers via API key, detects
//! injection and traversal attempts, enforces per-scope rate limits,
//! annotates responses for regulatory compliance, and produces
//! privacy-preserving audit records. The crate exposes no server or CLI
//! of its own; a host axum application mounts it as middleware or drives
//! the [`middleware::RequestGate`] directly.
//!
//! ## Pipeline Order
//!
//! Stages run strictly in sequence per request and short-circuit at the
//! first rejection:
//!
//! 1. Transport security (HTTPS posture, production only)
//! 2. Rate limiting (fixed windows, three tiers)
//! 3. API key resolution (advisory, fail-open, meters usage)
//! 4. Threat detection (SQL injection, XSS, path traversal, structural limits)
//! 5. Compliance checks (origins, terminology allow-list)
//!
//! An audit record is opened before the first stage and finalized
//! exactly once per request, on the rejection path or after the host
//! handler responds. Detection here is heuristic, a first line of
//! defense; it does not replace parameterized data access downstream.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use api_sentinel::{RequestGate, SentinelConfig};
//! use api_sentinel::middleware::{sentinel_middleware, InMemoryKeyStore, TracingAuditSink};
//!
//! let gate = Arc::new(RequestGate::new(
//!     SentinelConfig::default(),
//!     Arc::new(InMemoryKeyStore::new()),
//!     Arc::new(TracingAuditSink),
//! )?);
//!
//! let app = axum::Router::new()
//!     .route("/api/convert", axum::routing::post(convert_handler))
//!     .layer(axum::middleware::from_fn_with_state(gate, sentinel_middleware));
//! ```

/// Core functionality: error taxonomy, configuration, and the request,
/// context, and response types shared by every stage
pub mod core;

/// The pipeline stages, the orchestrating gate, and the axum adapter
pub mod middleware;

/// Logging subscriber setup for embedding hosts
pub mod observability;

// Re-export the types most hosts need directly
pub use core::config::SentinelConfig;
pub use core::error::{SentinelError, SentinelResult};
pub use core::types::{AuditRecord, AuthContext, IncomingRequest, RequestContext, SentinelResponse};
pub use middleware::{GateDecision, RequestGate};
