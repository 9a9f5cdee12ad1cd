pub mod api_key;
pub mod audit;
pub mod compliance;
pub mod layer;
pub mod pipeline;
pub mod rate_limit;
pub mod threat;

pub use api_key::{ApiKeyStage, ApplicationRecord, InMemoryKeyStore, KeyStatus, KeyStore};
pub use audit::{AuditLogger, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use compliance::{ComplianceStage, TransportSecurityStage};
pub use layer::sentinel_middleware;
pub use pipeline::{GateDecision, GateStage, RequestGate};
pub use rate_limit::{RateLimitStage, RateLimiter, RouteTier};
pub use threat::{DetectionEvent, ThreatCategory, ThreatDetector, ThreatStage};
