//! # Rate Limiting Middleware
//!
//! Fixed-window rate limiting with three independent tiers. Routes are
//! classified by path prefix into `strict` (sensitive data), `auth`
//! (authentication endpoints), or `normal` (everything else), and every
//! caller gets a separate window per tier.
//!
//! ## Key Features
//! - Fixed-window counting with atomic check-and-increment
//! - Per-tier ceilings and windows, independent per caller
//! - Health-check route exemption
//! - Surviving requests stamped with `x-ratelimit-*` headers
//! - Expired-window purge for long-running processes

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use dashmap::DashMap;
use metrics::counter;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::core::config::RateLimitConfig;
use crate::core::error::{SentinelError, SentinelResult};
use crate::core::types::{RateLimitDecision, RequestContext};
use crate::middleware::audit::anonymize_ip;
use crate::middleware::pipeline::GateStage;

/// Tier a route falls into for limiting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTier {
    /// Sensitive data routes with the lowest ceiling
    Strict,
    /// Authentication routes, limited hardest against brute force
    Auth,
    /// Everything else
    Normal,
}

impl RouteTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTier::Strict => "strict",
            RouteTier::Auth => "auth",
            RouteTier::Normal => "normal",
        }
    }
}

impl fmt::Display for RouteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One caller's window within one tier.
#[derive(Debug, Clone, Copy)]
struct Window {
    /// Unix timestamp (seconds) when the window opened
    started_at: u64,
    /// Requests counted in the current window
    count: u32,
    /// Window length in seconds, kept for purging
    window_secs: u64,
}

/// Fixed-window rate limiter over an in-process concurrent map.
///
/// The map key combines tier and caller identity, so the same caller
/// consumes separate budgets on `/api/auth/login` and `/api/patients`.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Classify a path into its tier by longest-prefix convention:
    /// auth prefixes win over strict ones so `/api/auth` under a broader
    /// strict prefix still counts as auth.
    pub fn classify(&self, path: &str) -> RouteTier {
        if self
            .config
            .auth_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return RouteTier::Auth;
        }
        if self
            .config
            .strict_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return RouteTier::Strict;
        }
        RouteTier::Normal
    }

    /// Whether the path is the designated health-check route.
    pub fn is_exempt(&self, path: &str) -> bool {
        path == self.config.health_check_path
    }

    fn tier_limits(&self, tier: RouteTier) -> (u32, Duration) {
        let tier_config = match tier {
            RouteTier::Strict => &self.config.strict,
            RouteTier::Auth => &self.config.auth,
            RouteTier::Normal => &self.config.normal,
        };
        (tier_config.max_requests, tier_config.window)
    }

    /// Count a request against its window and decide whether it may pass.
    pub fn check(&self, identity: &str, path: &str) -> SentinelResult<RateLimitDecision> {
        self.check_at(identity, path, SystemTime::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock, so window
    /// expiry is testable without sleeping.
    pub fn check_at(
        &self,
        identity: &str,
        path: &str,
        now: SystemTime,
    ) -> SentinelResult<RateLimitDecision> {
        let now_secs = unix_seconds(now);

        if self.is_exempt(path) {
            return Ok(RateLimitDecision {
                limit: 0,
                remaining: 0,
                reset_at: now_secs,
                exempt: true,
            });
        }

        let tier = self.classify(path);
        let (limit, window) = self.tier_limits(tier);
        let window_secs = window.as_secs().max(1);
        let key = format!("{}:{}", tier.as_str(), identity);

        // The entry guard serializes the whole read-check-increment
        // sequence for one caller, so concurrent hits within the same
        // window can never both observe the last remaining slot.
        let mut entry = self.windows.entry(key).or_insert(Window {
            started_at: now_secs,
            count: 0,
            window_secs,
        });
        let window_state = entry.value_mut();

        if now_secs.saturating_sub(window_state.started_at) >= window_secs {
            window_state.started_at = now_secs;
            window_state.count = 0;
            window_state.window_secs = window_secs;
        }

        let reset_at = window_state.started_at + window_secs;
        if window_state.count >= limit {
            let retry_after_secs = reset_at.saturating_sub(now_secs).max(1);
            drop(entry);
            counter!("sentinel_rate_limited_total", "tier" => tier.as_str()).increment(1);
            return Err(SentinelError::RateLimitExceeded {
                limit,
                retry_after_secs,
                reset_at,
            });
        }

        window_state.count += 1;
        let remaining = limit - window_state.count;
        drop(entry);

        Ok(RateLimitDecision {
            limit,
            remaining,
            reset_at,
            exempt: false,
        })
    }

    /// Drop windows whose reset time has passed. Callers with an open
    /// window are retained even when idle, matching fixed-window
    /// semantics exactly.
    pub fn purge_expired(&self) {
        self.purge_expired_at(SystemTime::now());
    }

    /// Same as [`purge_expired`](Self::purge_expired) with an explicit
    /// clock.
    pub fn purge_expired_at(&self, now: SystemTime) {
        let now_secs = unix_seconds(now);
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now_secs.saturating_sub(window.started_at) < window.window_secs);
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            debug!(dropped, "Purged expired rate-limit windows");
        }
    }

    /// Number of live windows, for diagnostics.
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Pipeline stage wrapping the limiter. Rejections translate to 429 with
/// back-off headers; admitted requests get their decision recorded for
/// response stamping.
#[derive(Debug)]
pub struct RateLimitStage {
    limiter: RateLimiter,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl GateStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> SentinelResult<()> {
        let identity = ctx.request.client_ip();
        let path = ctx.request.path();

        match self.limiter.check(&identity, path) {
            Ok(decision) => {
                ctx.rate_limit = Some(decision);
                Ok(())
            }
            Err(err) => {
                if let SentinelError::RateLimitExceeded {
                    limit,
                    retry_after_secs,
                    ..
                } = &err
                {
                    warn!(
                        client = %anonymize_ip(&identity),
                        path = %path,
                        limit = limit,
                        retry_after_secs = retry_after_secs,
                        "Rate limit exceeded"
                    );
                }
                Err(err)
            }
        }
    }

    fn on_response(&self, ctx: &RequestContext, _status: StatusCode, headers: &mut HeaderMap) {
        let Some(decision) = ctx.rate_limit else {
            return;
        };
        if decision.exempt {
            return;
        }
        if let Ok(value) = decision.limit.to_string().parse() {
            headers.insert("x-ratelimit-limit", value);
        }
        if let Ok(value) = decision.remaining.to_string().parse() {
            headers.insert("x-ratelimit-remaining", value);
        }
        if let Ok(value) = decision.reset_at.to_string().parse() {
            headers.insert("x-ratelimit-reset", value);
        }
    }
}
