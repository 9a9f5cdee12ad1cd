//! # Compliance Annotation Middleware
//!
//! Regulatory checks and response annotation for health-data routes:
//! transport security enforcement, origin checking, terminology
//! allow-listing, and the cache-control / transparency header set that
//! sensitive responses must carry.
//!
//! Terminology validation is the allow-list counterpart of the threat
//! detector's block-lists: only coding systems from the configured
//! national authorities are accepted, everything else is rejected.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::core::config::ComplianceConfig;
use crate::core::error::{SentinelError, SentinelResult};
use crate::core::types::RequestContext;
use crate::middleware::pipeline::GateStage;

/// JSON key whose values name a coding system.
const SYSTEM_KEY: &str = "system";

// ============================================================================
// Transport security
// ============================================================================

/// Rejects plaintext requests in production posture.
///
/// A request is considered secure when the connection itself is TLS or
/// the trusted forwarded-protocol header claims `https`. Outside
/// production the stage only logs, so local development works over
/// plain HTTP.
#[derive(Debug)]
pub struct TransportSecurityStage {
    production: bool,
    forwarded_proto_header: String,
}

impl TransportSecurityStage {
    pub fn new(production: bool, forwarded_proto_header: String) -> Self {
        Self {
            production,
            forwarded_proto_header,
        }
    }

    fn is_secure(&self, ctx: &RequestContext) -> bool {
        if ctx.request.secure {
            return true;
        }
        ctx.request
            .header(&self.forwarded_proto_header)
            .map(|proto| proto.eq_ignore_ascii_case("https"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl GateStage for TransportSecurityStage {
    fn name(&self) -> &'static str {
        "transport_security"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> SentinelResult<()> {
        if self.is_secure(ctx) {
            return Ok(());
        }
        if !self.production {
            debug!(
                request_id = %ctx.request.id,
                "Plaintext request allowed outside production"
            );
            return Ok(());
        }
        warn!(
            request_id = %ctx.request.id,
            path = %ctx.request.path(),
            "Plaintext request rejected"
        );
        Err(SentinelError::upgrade_required(
            "this API only accepts HTTPS connections",
        ))
    }
}

// ============================================================================
// Compliance annotation
// ============================================================================

/// Classifies sensitive routes, validates origins and terminology
/// systems, and stamps the regulatory response headers.
#[derive(Debug)]
pub struct ComplianceStage {
    config: ComplianceConfig,
    production: bool,
}

impl ComplianceStage {
    pub fn new(config: ComplianceConfig, production: bool) -> Self {
        Self { config, production }
    }

    /// Whether the path serves health data and needs the non-cache
    /// header set.
    pub fn is_health_data(&self, path: &str) -> bool {
        self.config
            .health_data_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether the path accepts terminology submissions whose coding
    /// systems must be allow-listed.
    pub fn is_terminology(&self, path: &str) -> bool {
        self.config
            .terminology_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Validate a single coding system value against the allow-list.
    fn check_system(&self, system: &str, location: &str) -> SentinelResult<()> {
        if !system.starts_with("urn:") && Url::parse(system).is_err() {
            return Err(SentinelError::compliance(format!(
                "coding system at {} is not a valid URI",
                location
            )));
        }
        if !self
            .config
            .allowed_terminology_systems
            .iter()
            .any(|allowed| allowed == system)
        {
            return Err(SentinelError::compliance(format!(
                "coding system '{}' at {} is not an approved terminology authority",
                system, location
            )));
        }
        Ok(())
    }

    /// Walk the payload and validate every `system` value. The threat
    /// stage has already bounded the nesting depth of anything that
    /// reaches this point.
    fn check_terminology_systems(&self, value: &Value, location: &str) -> SentinelResult<()> {
        match value {
            Value::Object(map) => {
                for (key, item) in map {
                    let child = format!("{}.{}", location, key);
                    if key == SYSTEM_KEY {
                        if let Value::String(system) = item {
                            self.check_system(system, &child)?;
                        }
                    }
                    self.check_terminology_systems(item, &child)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.check_terminology_systems(item, &format!("{}.{}", location, index))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Validate the `Origin` header against the static allow-list plus
    /// the authenticated application's own origins.
    fn check_origin(&self, ctx: &RequestContext) -> SentinelResult<()> {
        let Some(origin) = ctx.request.header("origin") else {
            return Ok(());
        };

        let statically_allowed = self
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin);
        let application_allowed = ctx
            .auth
            .as_ref()
            .map(|auth| auth.allowed_origins.iter().any(|allowed| allowed == origin))
            .unwrap_or(false);

        if statically_allowed || application_allowed {
            return Ok(());
        }

        if self.production {
            warn!(
                request_id = %ctx.request.id,
                origin = %origin,
                "Disallowed origin rejected"
            );
            return Err(SentinelError::compliance_forbidden(format!(
                "origin '{}' is not allowed",
                origin
            )));
        }

        warn!(
            request_id = %ctx.request.id,
            origin = %origin,
            "Disallowed origin tolerated outside production"
        );
        Ok(())
    }

    fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

#[async_trait]
impl GateStage for ComplianceStage {
    fn name(&self) -> &'static str {
        "compliance"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> SentinelResult<()> {
        ctx.health_data = self.is_health_data(ctx.request.path());

        self.check_origin(ctx)?;

        if self.is_terminology(ctx.request.path()) && !ctx.request.body.is_empty() {
            if let Ok(root) = serde_json::from_slice::<Value>(&ctx.request.body) {
                self.check_terminology_systems(&root, "body")?;
            }
        }

        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, _status: StatusCode, headers: &mut HeaderMap) {
        // Transparency headers go on every response
        Self::insert(headers, "x-data-controller", &self.config.data_controller);
        Self::insert(headers, "x-privacy-policy", &self.config.privacy_policy_path);
        Self::insert(headers, "x-data-retention", &self.config.retention_policy);
        Self::insert(headers, "x-personal-data-processing", "true");

        // Classify by path, not by context flag: a request rejected
        // before this stage ran still gets its markers.
        if ctx.health_data || self.is_health_data(ctx.request.path()) {
            Self::insert(
                headers,
                "cache-control",
                "no-store, no-cache, must-revalidate, private",
            );
            Self::insert(headers, "pragma", "no-cache");
            Self::insert(headers, "expires", "0");
            Self::insert(headers, "x-health-data", "true");
            Self::insert(headers, "x-data-classification", "sensitive-health-data");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AuthContext, IncomingRequest};
    use axum::http::{HeaderMap, Method};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(path: &str, headers: HeaderMap, body: Vec<u8>) -> RequestContext {
        let request = IncomingRequest::new(
            Method::POST,
            path.parse().unwrap(),
            headers,
            body,
            "203.0.113.200:443".parse().unwrap(),
        );
        RequestContext::new(Arc::new(request))
    }

    fn stage(production: bool) -> ComplianceStage {
        ComplianceStage::new(ComplianceConfig::default(), production)
    }

    #[tokio::test]
    async fn test_transport_rejects_plaintext_in_production() {
        let transport = TransportSecurityStage::new(true, "x-forwarded-proto".to_string());
        let mut plaintext = ctx("/api/convert", HeaderMap::new(), Vec::new());
        let err = transport.on_request(&mut plaintext).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn test_transport_accepts_forwarded_https() {
        let transport = TransportSecurityStage::new(true, "x-forwarded-proto".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        let mut proxied = ctx("/api/convert", headers, Vec::new());
        transport.on_request(&mut proxied).await.unwrap();

        let mut direct_tls = ctx("/api/convert", HeaderMap::new(), Vec::new());
        let request = Arc::make_mut(&mut direct_tls.request);
        request.secure = true;
        transport.on_request(&mut direct_tls).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_tolerates_plaintext_in_development() {
        let transport = TransportSecurityStage::new(false, "x-forwarded-proto".to_string());
        let mut plaintext = ctx("/api/convert", HeaderMap::new(), Vec::new());
        transport.on_request(&mut plaintext).await.unwrap();
    }

    #[test]
    fn test_health_data_classification() {
        let stage = stage(false);
        assert!(stage.is_health_data("/api/convert/hl7"));
        assert!(stage.is_health_data("/api/patients/42"));
        assert!(!stage.is_health_data("/api/docs"));
        assert!(!stage.is_health_data("/health"));
    }

    #[tokio::test]
    async fn test_allow_listed_terminology_system_passes() {
        let stage = stage(false);
        let body = serde_json::to_vec(&json!({
            "coding": [{"system": "http://loinc.org", "code": "718-7"}]
        }))
        .unwrap();
        let mut ctx = ctx("/api/terminology/validate", HeaderMap::new(), body);
        stage.on_request(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_terminology_system_rejected() {
        let stage = stage(false);
        let body = serde_json::to_vec(&json!({
            "coding": [{"system": "http://rogue.example.com/codes", "code": "X1"}]
        }))
        .unwrap();
        let mut ctx = ctx("/api/terminology/validate", HeaderMap::new(), body);
        let err = stage.on_request(&mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("rogue.example.com"));
    }

    #[tokio::test]
    async fn test_nested_system_values_are_found() {
        let stage = stage(false);
        let body = serde_json::to_vec(&json!({
            "resource": {
                "code": {
                    "coding": [
                        {"system": "http://snomed.info/sct", "code": "386661006"},
                        {"system": "http://bad.example.org", "code": "zzz"}
                    ]
                }
            }
        }))
        .unwrap();
        let mut ctx = ctx("/api/terminology/submit", HeaderMap::new(), body);
        assert!(stage.on_request(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_systems_outside_terminology_routes_are_ignored() {
        let stage = stage(false);
        let body = serde_json::to_vec(&json!({"system": "http://bad.example.org"})).unwrap();
        let mut ctx = ctx("/api/convert", HeaderMap::new(), body);
        stage.on_request(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_disallowed_origin_forbidden_in_production() {
        let stage = stage(true);
        let mut headers = HeaderMap::new();
        headers.insert("origin", "https://evil.example.com".parse().unwrap());
        let mut ctx = ctx("/api/convert", headers, Vec::new());
        let err = stage.on_request(&mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_disallowed_origin_tolerated_in_development() {
        let stage = stage(false);
        let mut headers = HeaderMap::new();
        headers.insert("origin", "https://evil.example.com".parse().unwrap());
        let mut ctx = ctx("/api/convert", headers, Vec::new());
        stage.on_request(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_application_origin_is_honored() {
        let stage = stage(true);
        let mut headers = HeaderMap::new();
        headers.insert("origin", "https://portal.example.org".parse().unwrap());
        let mut ctx = ctx("/api/convert", headers, Vec::new());
        ctx.set_auth(AuthContext {
            key_id: "key-1".to_string(),
            application_id: "app-1".to_string(),
            application_name: "portal".to_string(),
            allowed_origins: vec!["https://portal.example.org".to_string()],
            usage_count: 1,
        });
        stage.on_request(&mut ctx).await.unwrap();
    }

    #[test]
    fn test_health_data_response_headers() {
        let stage = stage(false);
        let ctx = ctx("/api/patients/42", HeaderMap::new(), Vec::new());
        let mut headers = HeaderMap::new();
        stage.on_response(&ctx, StatusCode::OK, &mut headers);

        assert_eq!(
            headers.get("cache-control").unwrap(),
            "no-store, no-cache, must-revalidate, private"
        );
        assert_eq!(headers.get("pragma").unwrap(), "no-cache");
        assert_eq!(headers.get("expires").unwrap(), "0");
        assert_eq!(headers.get("x-health-data").unwrap(), "true");
        assert!(headers.contains_key("x-data-controller"));
        assert!(headers.contains_key("x-privacy-policy"));
        assert!(headers.contains_key("x-data-retention"));
    }

    #[test]
    fn test_plain_route_gets_only_transparency_headers() {
        let stage = stage(false);
        let ctx = ctx("/api/docs", HeaderMap::new(), Vec::new());
        let mut headers = HeaderMap::new();
        stage.on_response(&ctx, StatusCode::OK, &mut headers);

        assert!(headers.contains_key("x-data-controller"));
        assert!(!headers.contains_key("cache-control"));
        assert!(!headers.contains_key("x-health-data"));
    }

    #[test]
    fn test_markers_present_regardless_of_status() {
        let stage = stage(false);
        let ctx = ctx("/api/patients/42", HeaderMap::new(), Vec::new());
        for status in [StatusCode::OK, StatusCode::BAD_REQUEST, StatusCode::TOO_MANY_REQUESTS] {
            let mut headers = HeaderMap::new();
            stage.on_response(&ctx, status, &mut headers);
            assert!(headers.contains_key("cache-control"), "missing for {}", status);
        }
    }
}
