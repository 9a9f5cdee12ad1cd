//! # Configuration Module
//!
//! Configuration structures and loading for the sentinel pipeline.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Environment variable override support (`SENTINEL_*`)
//! - Validation with detailed error messages collected per field
//! - Sensible defaults for every section, so an empty file is valid

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::core::error::{SentinelError, SentinelResult};

/// Complete sentinel configuration.
///
/// Every section has defaults, so partial YAML files work: absent sections
/// fall back to the values documented on each field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Production-mode flag. Controls transport enforcement (426 for
    /// plaintext) and origin enforcement (403 instead of a warning).
    pub production: bool,

    /// API key extraction settings
    pub api_key: ApiKeyConfig,

    /// Threat detection thresholds
    pub threat: ThreatConfig,

    /// Rate limiting tiers and route classification
    pub rate_limit: RateLimitConfig,

    /// Regulatory checks and response annotation
    pub compliance: ComplianceConfig,

    /// Log subscriber settings
    pub logging: LogConfig,
}

impl SentinelConfig {
    /// Load configuration from a YAML file, apply environment overrides,
    /// and validate.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> SentinelResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SentinelError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: SentinelConfig = serde_yaml::from_str(&content)
            .map_err(|e| SentinelError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration.
    ///
    /// Variables follow the pattern `SENTINEL_<SECTION>_<FIELD>`, for
    /// example `SENTINEL_RATE_LIMIT_STRICT_MAX=20`.
    pub fn apply_env_overrides(&mut self) -> SentinelResult<()> {
        use std::env;

        if let Ok(production) = env::var("SENTINEL_PRODUCTION") {
            self.production = production
                .parse()
                .map_err(|e| SentinelError::config(format!("Invalid SENTINEL_PRODUCTION: {}", e)))?;
        }

        if let Ok(header) = env::var("SENTINEL_API_KEY_HEADER") {
            self.api_key.header_name = header;
        }

        if let Ok(size) = env::var("SENTINEL_MAX_BODY_BYTES") {
            self.threat.max_body_bytes = size.parse().map_err(|e| {
                SentinelError::config(format!("Invalid SENTINEL_MAX_BODY_BYTES: {}", e))
            })?;
        }

        if let Ok(window) = env::var("SENTINEL_RATE_LIMIT_WINDOW") {
            let window = humantime::parse_duration(&window).map_err(|e| {
                SentinelError::config(format!("Invalid SENTINEL_RATE_LIMIT_WINDOW: {}", e))
            })?;
            self.rate_limit.normal.window = window;
            self.rate_limit.strict.window = window;
            self.rate_limit.auth.window = window;
        }

        if let Ok(max) = env::var("SENTINEL_RATE_LIMIT_NORMAL_MAX") {
            self.rate_limit.normal.max_requests = max.parse().map_err(|e| {
                SentinelError::config(format!("Invalid SENTINEL_RATE_LIMIT_NORMAL_MAX: {}", e))
            })?;
        }

        if let Ok(max) = env::var("SENTINEL_RATE_LIMIT_STRICT_MAX") {
            self.rate_limit.strict.max_requests = max.parse().map_err(|e| {
                SentinelError::config(format!("Invalid SENTINEL_RATE_LIMIT_STRICT_MAX: {}", e))
            })?;
        }

        if let Ok(max) = env::var("SENTINEL_RATE_LIMIT_AUTH_MAX") {
            self.rate_limit.auth.max_requests = max.parse().map_err(|e| {
                SentinelError::config(format!("Invalid SENTINEL_RATE_LIMIT_AUTH_MAX: {}", e))
            })?;
        }

        if let Ok(path) = env::var("SENTINEL_HEALTH_CHECK_PATH") {
            self.rate_limit.health_check_path = path;
        }

        if let Ok(origins) = env::var("SENTINEL_ALLOWED_ORIGINS") {
            self.compliance.allowed_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }

        if let Ok(controller) = env::var("SENTINEL_DATA_CONTROLLER") {
            self.compliance.data_controller = controller;
        }

        if let Ok(level) = env::var("SENTINEL_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("SENTINEL_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate the configuration, collecting every problem before
    /// reporting.
    pub fn validate(&self) -> SentinelResult<()> {
        let mut errors = Vec::new();

        if self.api_key.header_name.is_empty() {
            errors.push("api_key.header_name cannot be empty".to_string());
        }
        for param in &self.api_key.query_params {
            if param.is_empty() {
                errors.push("api_key.query_params entries cannot be empty".to_string());
            }
        }

        if self.threat.max_header_value_len == 0 {
            errors.push("threat.max_header_value_len must be greater than 0".to_string());
        }
        if self.threat.max_body_bytes == 0 {
            errors.push("threat.max_body_bytes must be greater than 0".to_string());
        }
        if self.threat.max_json_depth == 0 {
            errors.push("threat.max_json_depth must be at least 1".to_string());
        }

        for (name, tier) in [
            ("normal", &self.rate_limit.normal),
            ("strict", &self.rate_limit.strict),
            ("auth", &self.rate_limit.auth),
        ] {
            if tier.max_requests == 0 {
                errors.push(format!(
                    "rate_limit.{} max_requests must be greater than 0",
                    name
                ));
            }
            if tier.window.as_secs() == 0 {
                errors.push(format!(
                    "rate_limit.{} window must be at least one second",
                    name
                ));
            }
        }

        if !self.rate_limit.health_check_path.starts_with('/') {
            errors.push(format!(
                "rate_limit.health_check_path must start with '/', got '{}'",
                self.rate_limit.health_check_path
            ));
        }

        for prefix in self
            .rate_limit
            .strict_prefixes
            .iter()
            .chain(&self.rate_limit.auth_prefixes)
            .chain(&self.compliance.health_data_prefixes)
            .chain(&self.compliance.terminology_prefixes)
        {
            if !prefix.starts_with('/') {
                errors.push(format!("route prefix must start with '/', got '{}'", prefix));
            }
        }

        for system in &self.compliance.allowed_terminology_systems {
            if !system.starts_with("urn:") && Url::parse(system).is_err() {
                errors.push(format!(
                    "compliance.allowed_terminology_systems entry is not a valid URI: '{}'",
                    system
                ));
            }
        }

        if self.compliance.data_controller.is_empty() {
            errors.push("compliance.data_controller cannot be empty".to_string());
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.logging.format)),
        }

        if !errors.is_empty() {
            return Err(SentinelError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            production: false,
            api_key: ApiKeyConfig::default(),
            threat: ThreatConfig::default(),
            rate_limit: RateLimitConfig::default(),
            compliance: ComplianceConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// API key extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Header carrying the key
    pub header_name: String,

    /// Query parameters accepted as a fallback, checked in order
    pub query_params: Vec<String>,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            header_name: "x-api-key".to_string(),
            query_params: vec!["apiKey".to_string(), "api_key".to_string()],
        }
    }
}

/// Threat detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    /// Answer detections with 403 instead of 400
    pub intrusion_response: bool,

    /// Maximum accepted header value length
    pub max_header_value_len: usize,

    /// Maximum accepted body size in bytes
    pub max_body_bytes: u64,

    /// Maximum JSON nesting depth walked during inspection
    pub max_json_depth: usize,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            intrusion_response: false,
            max_header_value_len: 8192,
            max_body_bytes: 10 * 1024 * 1024,
            max_json_depth: 32,
        }
    }
}

/// Request ceiling and window for one rate-limit tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum requests per window
    pub max_requests: u32,

    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Rate limiting tiers and route classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Default tier for unclassified routes
    pub normal: TierConfig,

    /// Tier for sensitive data routes
    pub strict: TierConfig,

    /// Tier for authentication routes
    pub auth: TierConfig,

    /// Path prefixes classified into the strict tier
    pub strict_prefixes: Vec<String>,

    /// Path prefixes classified into the auth tier
    pub auth_prefixes: Vec<String>,

    /// Exact path exempt from limiting
    pub health_check_path: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            normal: TierConfig {
                max_requests: 100,
                window: Duration::from_secs(15 * 60),
            },
            strict: TierConfig {
                max_requests: 20,
                window: Duration::from_secs(15 * 60),
            },
            auth: TierConfig {
                max_requests: 10,
                window: Duration::from_secs(15 * 60),
            },
            strict_prefixes: vec![
                "/api/convert".to_string(),
                "/api/patients".to_string(),
                "/api/terminology".to_string(),
            ],
            auth_prefixes: vec!["/api/auth".to_string()],
            health_check_path: "/health".to_string(),
        }
    }
}

/// Regulatory checks and response annotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Origins allowed for browser requests, in addition to per-key
    /// application origins
    pub allowed_origins: Vec<String>,

    /// Path prefixes that serve health data
    pub health_data_prefixes: Vec<String>,

    /// Path prefixes whose payloads carry coding systems
    pub terminology_prefixes: Vec<String>,

    /// Coding system URIs callers may reference
    pub allowed_terminology_systems: Vec<String>,

    /// Value of the data-controller transparency header
    pub data_controller: String,

    /// Value of the privacy-policy transparency header
    pub privacy_policy_path: String,

    /// Value of the retention transparency header
    pub retention_policy: String,

    /// Header trusted for the original protocol behind a proxy
    pub forwarded_proto_header: String,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            health_data_prefixes: vec![
                "/api/convert".to_string(),
                "/api/patients".to_string(),
                "/api/terminology".to_string(),
            ],
            terminology_prefixes: vec!["/api/terminology".to_string()],
            allowed_terminology_systems: vec![
                "http://snomed.info/sct".to_string(),
                "http://loinc.org".to_string(),
                "http://unitsofmeasure.org".to_string(),
                "https://mos.esante.gouv.fr/NOS".to_string(),
                "https://smt.esante.gouv.fr".to_string(),
                "urn:oid:1.2.250.1.213.1.1.5".to_string(),
            ],
            data_controller: "Sentinel Health Platform".to_string(),
            privacy_policy_path: "/privacy-policy".to_string(),
            retention_policy: "audit-12-months".to_string(),
            forwarded_proto_header: "x-forwarded-proto".to_string(),
        }
    }
}

/// Log subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level: trace, debug, info, warn, error
    pub level: String,

    /// Output format: text or json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SentinelConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.production);
        assert_eq!(config.rate_limit.normal.max_requests, 100);
        assert_eq!(config.rate_limit.strict.max_requests, 20);
        assert_eq!(config.rate_limit.auth.max_requests, 10);
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let mut config = SentinelConfig::default();
        config.rate_limit.strict.max_requests = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strict"));
    }

    #[test]
    fn test_bad_terminology_system_rejected() {
        let mut config = SentinelConfig::default();
        config
            .compliance
            .allowed_terminology_systems
            .push("not a uri".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_prefix_rejected() {
        let mut config = SentinelConfig::default();
        config.rate_limit.strict_prefixes.push("api/bad".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: SentinelConfig = serde_yaml::from_str(
            r#"
production: true
rate_limit:
  strict:
    max_requests: 5
    window: 1m
"#,
        )
        .unwrap();
        assert!(config.production);
        assert_eq!(config.rate_limit.strict.max_requests, 5);
        assert_eq!(config.rate_limit.strict.window, Duration::from_secs(60));
        // Untouched sections keep their defaults
        assert_eq!(config.rate_limit.normal.max_requests, 100);
        assert_eq!(config.api_key.header_name, "x-api-key");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
api_key:
  header_name: x-service-key
  query_params: ["apiKey"]
threat:
  max_json_depth: 16
"#
        )
        .unwrap();

        let config = SentinelConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.api_key.header_name, "x-service-key");
        assert_eq!(config.threat.max_json_depth, 16);
        assert_eq!(config.rate_limit.normal.max_requests, 100);
    }

    #[tokio::test]
    async fn test_load_failures_surface_as_configuration_errors() {
        let missing = SentinelConfig::load_from_file("/nonexistent/sentinel.yaml")
            .await
            .unwrap_err();
        assert_eq!(missing.error_type(), "configuration_error");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key: [not, a, mapping").unwrap();
        let malformed = SentinelConfig::load_from_file(file.path()).await.unwrap_err();
        assert_eq!(malformed.error_type(), "configuration_error");
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SENTINEL_RATE_LIMIT_STRICT_MAX", "55");
        std::env::set_var("SENTINEL_DATA_CONTROLLER", "Test Controller");

        let mut config = SentinelConfig::default();
        config.apply_env_overrides().unwrap();

        std::env::remove_var("SENTINEL_RATE_LIMIT_STRICT_MAX");
        std::env::remove_var("SENTINEL_DATA_CONTROLLER");

        assert_eq!(config.rate_limit.strict.max_requests, 55);
        assert_eq!(config.compliance.data_controller, "Test Controller");
    }
}
