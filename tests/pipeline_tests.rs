//! # Request Gate Integration Tests
//!
//! End-to-end tests driving the gate through its direct
//! `admit`/`complete` API: threat short-circuits, rate tiers, advisory
//! authentication, compliance annotation, and the one-audit-record
//! contract.

use axum::http::{HeaderMap, Method, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use api_sentinel::core::config::SentinelConfig;
use api_sentinel::core::types::IncomingRequest;
use api_sentinel::middleware::{
    ApplicationRecord, GateDecision, InMemoryKeyStore, KeyStatus, MemoryAuditSink, RequestGate,
};

/// Helper to build a gate over fresh in-memory collaborators.
fn build_gate(config: SentinelConfig) -> (RequestGate, Arc<InMemoryKeyStore>, Arc<MemoryAuditSink>) {
    let store = Arc::new(InMemoryKeyStore::new());
    store.insert_application(ApplicationRecord {
        id: "app-1".to_string(),
        name: "Conversion Portal".to_string(),
        allowed_origins: vec!["https://portal.example.org".to_string()],
    });
    store.insert_key("key-1", "portal-secret", "app-1", KeyStatus::Active);

    let sink = Arc::new(MemoryAuditSink::new());
    let gate = RequestGate::new(config, store.clone(), sink.clone()).unwrap();
    (gate, store, sink)
}

fn get(path_and_query: &str) -> IncomingRequest {
    IncomingRequest::new(
        Method::GET,
        path_and_query.parse().unwrap(),
        HeaderMap::new(),
        Vec::new(),
        "203.0.113.7:4711".parse().unwrap(),
    )
}

fn post_json(path: &str, body: serde_json::Value) -> IncomingRequest {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    IncomingRequest::new(
        Method::POST,
        path.parse().unwrap(),
        headers,
        serde_json::to_vec(&body).unwrap(),
        "203.0.113.7:4711".parse().unwrap(),
    )
}

fn expect_rejection(decision: GateDecision) -> api_sentinel::SentinelResponse {
    match decision {
        GateDecision::Rejected(response) => response,
        GateDecision::Admitted(_) => panic!("expected a rejection"),
    }
}

#[tokio::test]
async fn injection_payload_is_rejected_before_any_handler() {
    let (gate, _, sink) = build_gate(SentinelConfig::default());

    let body = json!({"name": "a' OR '1'='1"});
    let response = expect_rejection(gate.admit(post_json("/api/other", body)).await);

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(parsed["success"], false);
    assert!(parsed["error"].is_string());
    assert_eq!(parsed["code"], "SQL_INJECTION_DETECTED");

    // Exactly one audit record, marked unsuccessful
    assert_eq!(sink.len(), 1);
    assert!(!sink.records()[0].success);
}

#[tokio::test]
async fn clean_requests_pass_repeatedly() {
    let (gate, _, sink) = build_gate(SentinelConfig::default());

    for _ in 0..5 {
        let decision = gate
            .admit(post_json("/api/other", json!({"note": "routine visit"})))
            .await;
        let ctx = match decision {
            GateDecision::Admitted(ctx) => ctx,
            GateDecision::Rejected(response) => panic!("rejected with {}", response.status),
        };
        let mut headers = HeaderMap::new();
        gate.complete(ctx, StatusCode::OK, &mut headers);
    }
    assert_eq!(sink.len(), 5);
    assert!(sink.records().iter().all(|record| record.success));
}

#[tokio::test]
async fn auth_tier_rejects_the_eleventh_request() {
    let mut config = SentinelConfig::default();
    config.rate_limit.auth.max_requests = 10;
    config.rate_limit.auth.window = Duration::from_secs(15 * 60);
    let (gate, _, _) = build_gate(config);

    for i in 0..10 {
        match gate.admit(get("/api/auth/login")).await {
            GateDecision::Admitted(_) => {}
            GateDecision::Rejected(response) => {
                panic!("request {} rejected with {}", i + 1, response.status)
            }
        }
    }

    let response = expect_rejection(gate.admit(get("/api/auth/login")).await);
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers.contains_key("retry-after"));
    assert_eq!(response.headers.get("x-ratelimit-remaining").unwrap(), "0");

    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    let retry_after = parsed["retryAfter"].as_u64().unwrap();
    assert!(retry_after >= 1 && retry_after <= 15 * 60);
}

#[tokio::test]
async fn health_check_is_never_limited() {
    let mut config = SentinelConfig::default();
    config.rate_limit.normal.max_requests = 2;
    let (gate, _, _) = build_gate(config);

    for _ in 0..20 {
        assert!(matches!(
            gate.admit(get("/health")).await,
            GateDecision::Admitted(_)
        ));
    }
}

#[tokio::test]
async fn unknown_key_never_blocks() {
    let (gate, _, _) = build_gate(SentinelConfig::default());

    let mut request = get("/api/other");
    request
        .headers
        .insert("x-api-key", "no-such-key".parse().unwrap());
    let decision = gate.admit(request).await;
    match decision {
        GateDecision::Admitted(ctx) => assert!(!ctx.is_authenticated()),
        GateDecision::Rejected(response) => panic!("fail-open violated: {}", response.status),
    }
}

#[tokio::test]
async fn valid_key_attaches_identity_and_meters_usage() {
    let (gate, store, _) = build_gate(SentinelConfig::default());

    for expected in 1..=3u64 {
        let mut request = get("/api/other");
        request
            .headers
            .insert("x-api-key", "portal-secret".parse().unwrap());
        match gate.admit(request).await {
            GateDecision::Admitted(ctx) => {
                let auth = ctx.auth.as_ref().unwrap();
                assert_eq!(auth.application_name, "Conversion Portal");
                assert_eq!(auth.usage_count, expected);
            }
            GateDecision::Rejected(response) => panic!("rejected with {}", response.status),
        }
    }
    assert_eq!(store.usage_count("key-1"), Some(3));
}

#[tokio::test]
async fn health_data_responses_carry_non_cache_headers() {
    let (gate, _, _) = build_gate(SentinelConfig::default());

    let decision = gate
        .admit(post_json("/api/convert", json!({"message": "MSH|..."})))
        .await;
    let ctx = match decision {
        GateDecision::Admitted(ctx) => ctx,
        GateDecision::Rejected(response) => panic!("rejected with {}", response.status),
    };
    assert!(ctx.health_data);

    let mut headers = HeaderMap::new();
    gate.complete(ctx, StatusCode::OK, &mut headers);
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "no-store, no-cache, must-revalidate, private"
    );
    assert_eq!(headers.get("x-health-data").unwrap(), "true");
    assert!(headers.contains_key("x-data-controller"));
    assert!(headers.contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn terminology_submission_outside_allow_list_rejected() {
    let (gate, _, sink) = build_gate(SentinelConfig::default());

    let bad = json!({"coding": [{"system": "http://rogue.example.com", "code": "X"}]});
    let response = expect_rejection(gate.admit(post_json("/api/terminology/validate", bad)).await);
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(parsed["error"], "compliance_violation");

    let good = json!({"coding": [{"system": "http://loinc.org", "code": "718-7"}]});
    assert!(matches!(
        gate.admit(post_json("/api/terminology/validate", good)).await,
        GateDecision::Admitted(_)
    ));

    // One record per request across both outcomes
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn production_posture_rejects_plaintext() {
    let mut config = SentinelConfig::default();
    config.production = true;
    let (gate, _, _) = build_gate(config);

    let response = expect_rejection(gate.admit(get("/api/other")).await);
    assert_eq!(response.status, StatusCode::UPGRADE_REQUIRED);

    let mut proxied = get("/api/other");
    proxied
        .headers
        .insert("x-forwarded-proto", "https".parse().unwrap());
    assert!(matches!(
        gate.admit(proxied).await,
        GateDecision::Admitted(_)
    ));
}

#[tokio::test]
async fn oversized_header_yields_invalid_header_message() {
    let (gate, _, _) = build_gate(SentinelConfig::default());

    let mut request = get("/api/other");
    request.headers.insert(
        "x-custom",
        axum::http::HeaderValue::from_str(&"a".repeat(9000)).unwrap(),
    );
    let response = expect_rejection(gate.admit(request).await);
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(parsed["error"], "validation_rejected");
    assert!(parsed["message"]
        .as_str()
        .unwrap()
        .to_lowercase()
        .contains("header"));
}

#[tokio::test]
async fn audit_record_is_anonymized_and_sessioned() {
    let (gate, _, sink) = build_gate(SentinelConfig::default());

    let mut request = get("/api/other");
    request
        .headers
        .insert("user-agent", "integration-suite/1.0".parse().unwrap());
    let ctx = match gate.admit(request).await {
        GateDecision::Admitted(ctx) => ctx,
        GateDecision::Rejected(response) => panic!("rejected with {}", response.status),
    };
    gate.complete(ctx, StatusCode::OK, &mut HeaderMap::new());

    let record = &sink.records()[0];
    assert_eq!(record.client, "203.0.113.xxx");
    assert_eq!(record.session.len(), 16);
    assert_eq!(record.method, "GET");
    assert_eq!(record.path, "/api/other");
}

#[tokio::test]
async fn concurrent_metered_requests_lose_no_usage() {
    let (gate, store, _) = build_gate(SentinelConfig::default());
    let gate = Arc::new(gate);

    let mut handles = Vec::new();
    for _ in 0..40 {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            let mut request = get("/api/other");
            request
                .headers
                .insert("x-api-key", "portal-secret".parse().unwrap());
            matches!(gate.admit(request).await, GateDecision::Admitted(_))
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }
    assert_eq!(store.usage_count("key-1"), Some(40));
}
