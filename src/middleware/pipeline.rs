//! # Request Gate Pipeline
//!
//! Orchestrates the defense stages in a fixed order with short-circuit
//! semantics: the first stage rejection terminates the request and no
//! later stage or downstream handler runs. The gate also owns the audit
//! contract, opening a record before the first stage and finalizing it
//! exactly once on every path.
//!
//! ## Key Features
//! - Fixed stage order, short-circuit on first rejection
//! - Fail-open handling of internal stage faults (allow + warning)
//! - Response annotation (compliance and rate-limit headers) on both
//!   admitted and rejected responses
//! - Per-stage allow/deny counters

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::SentinelConfig;
use crate::core::error::{SentinelError, SentinelResult};
use crate::core::types::{IncomingRequest, RequestContext, SentinelResponse};
use crate::middleware::api_key::{ApiKeyStage, KeyStore};
use crate::middleware::audit::{AuditLogger, AuditSink};
use crate::middleware::compliance::{ComplianceStage, TransportSecurityStage};
use crate::middleware::rate_limit::{RateLimitStage, RateLimiter};
use crate::middleware::threat::{ThreatDetector, ThreatStage};

/// One stage of the request gate.
///
/// A stage inspects the context during admission and may veto the
/// request by returning an error; it can also stamp response headers
/// once the outcome is known. Stages hold no per-request state.
#[async_trait]
pub trait GateStage: Send + Sync + fmt::Debug {
    /// Stage name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Inspect the request. `Err` with a client-facing status rejects
    /// it; `Err` with a server status is treated as an internal stage
    /// fault and handled fail-open by the gate.
    async fn on_request(&self, ctx: &mut RequestContext) -> SentinelResult<()>;

    /// Stamp response headers once the final status is known. Called on
    /// admitted and rejected responses alike.
    fn on_response(&self, _ctx: &RequestContext, _status: StatusCode, _headers: &mut HeaderMap) {}
}

/// Outcome of running the admission phase for one request.
#[derive(Debug)]
pub enum GateDecision {
    /// Every stage passed; the host should run its handler and then
    /// call [`RequestGate::complete`] with this context.
    Admitted(RequestContext),

    /// A stage vetoed the request. The response is fully annotated and
    /// the audit record is already finalized.
    Rejected(SentinelResponse),
}

/// The ordered defense pipeline.
///
/// Stage order is fixed at construction: transport security, rate
/// limiting, API key resolution, threat detection, compliance checks.
/// The transport check is the cheapest rejection and runs first; the
/// limiter runs before the regex-heavy detector so floods cannot burn
/// CPU; key resolution precedes detection only so detection logs can
/// carry application identity, never to block.
#[derive(Debug)]
pub struct RequestGate {
    stages: Vec<Arc<dyn GateStage>>,
    compliance: Arc<ComplianceStage>,
    audit: AuditLogger,
    max_body_bytes: u64,
}

impl RequestGate {
    /// Wire the stages from configuration, a key store, and an audit
    /// sink. Fails only on invalid configuration (pattern compilation).
    pub fn new(
        config: SentinelConfig,
        key_store: Arc<dyn KeyStore>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> SentinelResult<Self> {
        let detector = ThreatDetector::new(&config.threat)?;
        let max_body_bytes = config.threat.max_body_bytes;

        let transport = Arc::new(TransportSecurityStage::new(
            config.production,
            config.compliance.forwarded_proto_header.clone(),
        ));
        let rate_limit = Arc::new(RateLimitStage::new(RateLimiter::new(
            config.rate_limit.clone(),
        )));
        let api_key = Arc::new(ApiKeyStage::new(config.api_key.clone(), key_store));
        let threat = Arc::new(ThreatStage::new(detector, config.threat.intrusion_response));
        let compliance = Arc::new(ComplianceStage::new(
            config.compliance.clone(),
            config.production,
        ));

        let stages: Vec<Arc<dyn GateStage>> = vec![
            transport,
            rate_limit,
            api_key,
            threat,
            compliance.clone(),
        ];

        Ok(Self {
            stages,
            compliance,
            audit: AuditLogger::new(audit_sink)?,
            max_body_bytes,
        })
    }

    /// Body buffering ceiling for host adapters, in bytes.
    pub fn max_body_bytes(&self) -> u64 {
        self.max_body_bytes
    }

    /// Run the admission phase. The audit record is opened before the
    /// first stage, so a rejection at any point still produces exactly
    /// one record.
    pub async fn admit(&self, request: IncomingRequest) -> GateDecision {
        let mut ctx = RequestContext::new(Arc::new(request));

        // Health-data classification happens before anything can reject,
        // so rejected responses and audit records on sensitive routes
        // still carry their markers.
        ctx.health_data = self.compliance.is_health_data(ctx.request.path());
        self.audit.begin(&mut ctx);

        for stage in &self.stages {
            match stage.on_request(&mut ctx).await {
                Ok(()) => {
                    counter!("sentinel_stage_allowed_total", "stage" => stage.name()).increment(1);
                }
                Err(err) if err.status_code().is_server_error() => {
                    // An internal stage fault never blocks the request.
                    counter!("sentinel_stage_faults_total", "stage" => stage.name()).increment(1);
                    warn!(
                        request_id = %ctx.request.id,
                        stage = stage.name(),
                        error = %err,
                        "Stage fault, continuing fail-open"
                    );
                }
                Err(err) => {
                    counter!("sentinel_stage_denied_total", "stage" => stage.name()).increment(1);
                    debug!(
                        request_id = %ctx.request.id,
                        stage = stage.name(),
                        status = %err.status_code(),
                        "Request rejected"
                    );
                    let mut response = SentinelResponse::from_error(&err);
                    let status = response.status;
                    self.annotate(&ctx, status, &mut response.headers);
                    self.audit.finalize(&mut ctx, status);
                    return GateDecision::Rejected(response);
                }
            }
        }

        GateDecision::Admitted(ctx)
    }

    /// Finish an admitted request: stamp the response headers and emit
    /// the audit record. Exactly one of this method or the internal
    /// rejection path runs per request.
    pub fn complete(&self, mut ctx: RequestContext, status: StatusCode, headers: &mut HeaderMap) {
        self.annotate(&ctx, status, headers);
        self.audit.finalize(&mut ctx, status);
    }

    /// Reject a request the host could not even hand to the stages
    /// (body buffering failures). Produces the same annotated response
    /// and audit record a stage rejection would.
    pub fn reject(&self, request: IncomingRequest, err: SentinelError) -> SentinelResponse {
        let mut ctx = RequestContext::new(Arc::new(request));
        ctx.health_data = self.compliance.is_health_data(ctx.request.path());
        self.audit.begin(&mut ctx);

        let mut response = SentinelResponse::from_error(&err);
        let status = response.status;
        self.annotate(&ctx, status, &mut response.headers);
        self.audit.finalize(&mut ctx, status);
        response
    }

    fn annotate(&self, ctx: &RequestContext, status: StatusCode, headers: &mut HeaderMap) {
        for stage in &self.stages {
            stage.on_response(ctx, status, headers);
        }
    }
}
