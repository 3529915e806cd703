//! src/api/ratelimit.rs
//!
//! Per-client token-bucket rate limiting for the data plane. Each client IP
//! gets `rate` tokens per second with a one-second burst; node-to-node
//! routes bypass this entirely.

use crate::{api::AppState, error::Error};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Mutex,
    time::Instant,
};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by client IP. A rate of 0 disables limiting.
pub struct RateLimiter {
    rate: u32,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token for `ip`; false means the request is over budget.
    pub fn check(&self, ip: IpAddr) -> bool {
        if self.rate == 0 {
            return true;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.rate as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Resolves the client IP, honoring `X-Forwarded-For` only when the node is
/// configured to trust its proxy.
fn client_ip(state: &AppState, request: &Request) -> Option<IpAddr> {
    if state.config.trust_proxy {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|list| list.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Axum middleware for the data routes.
pub async fn limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.rate_limit == 0 {
        return next.run(request).await;
    }

    let Some(ip) = client_ip(&state, &request) else {
        // No attributable client; let it through rather than 500.
        return next.run(request).await;
    };

    if state.rate_limiter.check(ip) {
        next.run(request).await
    } else {
        tracing::debug!(client = %ip, "Rate limited");
        crate::api::ApiError(Error::RateLimited).into_response()
    }
}
