//! # Error Handling Module
//!
//! Defines every rejection the sentinel pipeline can produce, using the
//! `thiserror` crate, and maps each one to the HTTP status code and JSON
//! rejection body that clients see.
//!
//! ## Rejection Body Contract
//!
//! Every rejection carries the same JSON envelope:
//! - `success`: always `false`
//! - `error`: short machine-readable marker (stable across releases)
//! - `message`: human-readable explanation
//! - `code`: present only for threat detections (e.g. `SQL_INJECTION_DETECTED`)
//! - `retryAfter`: present only for rate-limit rejections, in seconds
//!
//! Internal faults (key store lookups, configuration problems) exist as
//! variants so they can travel through `SentinelResult`, but the pipeline
//! handles them fail-open and they never reach a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the sentinel.
pub type SentinelResult<T> = Result<T, SentinelError>;

/// All error conditions the request pipeline can raise.
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`,
/// which doubles as the `message` field of the rejection body.
#[derive(Debug, Error, Clone)]
pub enum SentinelError {
    /// Structural validation failures (oversized headers, oversized or
    /// malformed payloads) that are rejected before content inspection.
    #[error("Invalid {field}: {reason}")]
    ValidationRejection { field: String, reason: String },

    /// A threat pattern matched somewhere in the request. `intrusion`
    /// selects the 403 intrusion-detection response over the plain 400.
    #[error("{category} pattern detected in {location}")]
    ThreatDetected {
        category: String,
        code: &'static str,
        location: String,
        intrusion: bool,
    },

    /// The caller exhausted its request budget for the current window.
    #[error("Rate limit exceeded: maximum {limit} requests per window, retry in {retry_after_secs}s")]
    RateLimitExceeded {
        limit: u32,
        retry_after_secs: u64,
        reset_at: u64,
    },

    /// Regulatory checks failed (disallowed origin, unknown terminology
    /// system). `forbidden` selects 403 over 400.
    #[error("Compliance violation: {reason}")]
    ComplianceViolation { reason: String, forbidden: bool },

    /// Plaintext request reached a production deployment.
    #[error("HTTPS required: {reason}")]
    UpgradeRequired { reason: String },

    /// The key store could not answer a lookup. Handled fail-open by the
    /// authentication stage; never surfaces as a client response.
    #[error("API key lookup failed: {message}")]
    KeyLookup { message: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SentinelError {
    /// Create a validation rejection naming the offending request part.
    pub fn validation<S: Into<String>>(field: S, reason: S) -> Self {
        Self::ValidationRejection {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a compliance violation answered with 400.
    pub fn compliance<S: Into<String>>(reason: S) -> Self {
        Self::ComplianceViolation {
            reason: reason.into(),
            forbidden: false,
        }
    }

    /// Create a compliance violation answered with 403.
    pub fn compliance_forbidden<S: Into<String>>(reason: S) -> Self {
        Self::ComplianceViolation {
            reason: reason.into(),
            forbidden: true,
        }
    }

    /// Create an upgrade-required error for plaintext transport.
    pub fn upgrade_required<S: Into<String>>(reason: S) -> Self {
        Self::UpgradeRequired {
            reason: reason.into(),
        }
    }

    /// Create a key store lookup error.
    pub fn key_lookup<S: Into<String>>(message: S) -> Self {
        Self::KeyLookup {
            message: message.into(),
        }
    }

    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationRejection { .. } => StatusCode::BAD_REQUEST,
            Self::ThreatDetected { intrusion, .. } => {
                if *intrusion {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ComplianceViolation { forbidden, .. } => {
                if *forbidden {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            Self::UpgradeRequired { .. } => StatusCode::UPGRADE_REQUIRED,
            Self::KeyLookup { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the machine-readable marker used as the `error` field of the
    /// rejection body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ValidationRejection { .. } => "validation_rejected",
            Self::ThreatDetected { .. } => "threat_detected",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ComplianceViolation { .. } => "compliance_violation",
            Self::UpgradeRequired { .. } => "https_required",
            Self::KeyLookup { .. } => "key_lookup_failed",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Build the JSON rejection body for this error.
    pub fn rejection_body(&self) -> serde_json::Value {
        let mut body = json!({
            "success": false,
            "error": self.error_type(),
            "message": self.to_string(),
        });
        match self {
            Self::ThreatDetected { code, .. } => {
                body["code"] = json!(code);
            }
            Self::RateLimitExceeded {
                retry_after_secs, ..
            } => {
                body["retryAfter"] = json!(retry_after_secs);
            }
            _ => {}
        }
        body
    }
}

/// Implement conversion from regex::Error for pattern compilation at startup
impl From<regex::Error> for SentinelError {
    fn from(err: regex::Error) -> Self {
        Self::Configuration {
            message: format!("invalid detection pattern: {err}"),
        }
    }
}

/// Convert errors into HTTP responses with the rejection body contract.
///
/// Rate-limit rejections additionally carry `retry-after` and the
/// `x-ratelimit-*` header trio so well-behaved clients can back off
/// without parsing the body.
impl IntoResponse for SentinelError {
    fn into_response(self) -> Response {
        crate::core::types::SentinelResponse::from_error(&self).into_response()
    }
}
