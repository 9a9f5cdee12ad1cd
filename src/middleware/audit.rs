//! # Privacy-Preserving Audit Logging
//!
//! Produces exactly one audit record per request without storing raw
//! personal data. Client addresses are anonymized before they reach any
//! sink, request correlation uses a truncated daily hash instead of the
//! raw address, and records for health-data routes pass through a
//! sanitizer that redacts patient-identifying patterns.
//!
//! ## Key Features
//! - IP anonymization (IPv4 last octet, IPv6 tail groups)
//! - Daily session hashes: same caller correlates within a day, not across days
//! - Pattern-based redaction of names, birth dates, and long identifiers
//! - Pluggable sinks: tracing output for production, in-memory for tests

use chrono::{NaiveDate, Utc};
use metrics::counter;
use parking_lot::Mutex;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{info, warn};

use axum::http::StatusCode;

use crate::core::error::{SentinelError, SentinelResult};
use crate::core::types::{AuditRecord, RequestContext};

/// Sentinel value recorded when a client address cannot be parsed.
pub const UNKNOWN_CLIENT: &str = "unknown";

// ============================================================================
// Privacy transforms
// ============================================================================

/// Anonymize a client IP for logging.
///
/// IPv4 keeps the first three octets and masks the last
/// (`203.0.113.7` becomes `203.0.113.xxx`). IPv6 keeps the first four
/// groups and masks the rest. Anything unparseable becomes the
/// [`UNKNOWN_CLIENT`] sentinel rather than leaking through raw.
pub fn anonymize_ip(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() {
        return UNKNOWN_CLIENT.to_string();
    }

    if let Ok(v4) = trimmed.parse::<Ipv4Addr>() {
        let octets = v4.octets();
        return format!("{}.{}.{}.xxx", octets[0], octets[1], octets[2]);
    }

    if let Ok(v6) = trimmed.parse::<Ipv6Addr>() {
        let segments = v6.segments();
        return format!(
            "{:x}:{:x}:{:x}:{:x}:xxxx",
            segments[0], segments[1], segments[2], segments[3]
        );
    }

    UNKNOWN_CLIENT.to_string()
}

/// Derive the truncated session hash for a caller on a given day.
///
/// The digest input is `ip|user_agent|YYYY-MM-DD`, so the same caller
/// maps to a stable value within one day and an unlinkable one the next.
pub fn session_hash(ip: &str, user_agent: &str, date: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", ip, user_agent, date.format("%Y-%m-%d")));
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// [`session_hash`] for the current UTC day.
pub fn daily_session_hash(ip: &str, user_agent: &str) -> String {
    session_hash(ip, user_agent, Utc::now().date_naive())
}

/// Redacts patient-identifying patterns from log text.
///
/// Applied to audit record fields for health-data routes before any sink
/// sees them. Patterns cover caret-separated name pairs (`FAMILY^Given`),
/// eight-digit birth dates, thirteen-digit national identifiers starting
/// with 1 or 2, any digit run of eight or more, and raw IPv4 addresses.
#[derive(Debug)]
pub struct HealthDataSanitizer {
    patterns: Vec<Regex>,
    replacement: String,
}

impl HealthDataSanitizer {
    pub fn new() -> SentinelResult<Self> {
        let sources = [
            // FAMILY^Given name pairs as they appear in HL7-style payloads
            r"\b[A-ZÀ-Ÿ][A-ZÀ-Ÿ\-']+\^[A-Za-zÀ-ÿ][A-Za-zÀ-ÿ\-']*",
            // Thirteen-digit national identifiers (gender digit 1 or 2)
            r"\b[12]\d{12}\b",
            // Eight-digit birth dates (YYYYMMDD)
            r"\b\d{8}\b",
            // Any remaining long identifier
            r"\b\d{8,}\b",
            // Raw IPv4 addresses that slipped into free text
            r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        ];

        let mut patterns = Vec::with_capacity(sources.len());
        for source in sources {
            patterns.push(Regex::new(source).map_err(|e| {
                SentinelError::internal(format!("Failed to compile redaction pattern: {}", e))
            })?);
        }

        Ok(Self {
            patterns,
            replacement: "[REDACTED]".to_string(),
        })
    }

    /// Replace every match of every pattern with the redaction marker.
    pub fn sanitize(&self, data: &str) -> String {
        let mut sanitized = data.to_string();
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, self.replacement.as_str())
                .to_string();
        }
        sanitized
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for finalized audit records.
pub trait AuditSink: Send + Sync + fmt::Debug {
    fn record(&self, record: &AuditRecord);
}

/// Emits audit records as structured tracing events under the `audit`
/// target, so they can be filtered or routed independently of stage logs.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "audit",
            request_id = %record.request_id,
            method = %record.method,
            path = %record.path,
            client = %record.client,
            session = %record.session,
            status = record.status,
            duration_ms = record.duration_ms,
            success = record.success,
            health_data = record.health_data,
            "Request audited"
        );
    }
}

/// Collects audit records in memory. Intended for tests and short-lived
/// diagnostic runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

// ============================================================================
// Logger
// ============================================================================

/// Starts an audit record when a request enters the pipeline and emits
/// it exactly once when the outcome is known.
#[derive(Debug)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    sanitizer: HealthDataSanitizer,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> SentinelResult<Self> {
        Ok(Self {
            sink,
            sanitizer: HealthDataSanitizer::new()?,
        })
    }

    /// Open the audit record for a request. Privacy transforms are
    /// applied immediately: no raw address is ever stored in the draft.
    pub fn begin(&self, ctx: &mut RequestContext) {
        let raw_ip = ctx.request.client_ip();
        let user_agent = ctx.request.user_agent();

        ctx.audit = Some(AuditRecord {
            timestamp: Utc::now(),
            request_id: ctx.request.id.clone(),
            method: ctx.request.method.to_string(),
            path: ctx.request.path().to_string(),
            client: anonymize_ip(&raw_ip),
            session: daily_session_hash(&raw_ip, user_agent),
            user_agent: user_agent.to_string(),
            status: 0,
            duration_ms: 0,
            success: false,
            health_data: ctx.health_data,
        });
    }

    /// Complete the record with the response outcome and hand it to the
    /// sink. Taking the draft out of the context makes a second call a
    /// no-op, which keeps the one-record-per-request contract under any
    /// control flow.
    pub fn finalize(&self, ctx: &mut RequestContext, status: StatusCode) {
        let Some(mut record) = ctx.audit.take() else {
            warn!(
                request_id = %ctx.request.id,
                "Audit record already finalized for this request"
            );
            return;
        };

        record.status = status.as_u16();
        record.duration_ms = ctx.elapsed().as_millis() as u64;
        record.success = status.as_u16() < 400;
        record.health_data = ctx.health_data;

        if record.health_data {
            record.path = self.sanitizer.sanitize(&record.path);
            record.user_agent = self.sanitizer.sanitize(&record.user_agent);
        }

        counter!("sentinel_audit_records_total").increment(1);
        self.sink.record(&record);
    }

    /// Sanitize arbitrary log text with the health-data patterns.
    pub fn sanitize(&self, text: &str) -> String {
        self.sanitizer.sanitize(text)
    }
}
