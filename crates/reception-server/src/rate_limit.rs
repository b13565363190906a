//! Per-client token bucket limiting in front of the intake endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_seen: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_seen: now,
        }
    }

    fn take(&mut self, now: Instant, rate: f64, capacity: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_seen).as_secs_f64();
        self.last_seen = now;
        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, Bucket>>>,
    /// Tokens added per second.
    rate: f64,
    /// Burst size.
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub fn allow(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets
            .entry(client)
            .or_insert_with(|| Bucket::full(self.capacity, now))
            .take(now, self.rate, self.capacity)
    }

    /// Forget clients idle for at least `max_idle`. Returns how many.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < max_idle);
        before - buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let connect_info = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    if let Some(client) = client_ip(req.headers(), connect_info) {
        if !limiter.allow(client) {
            warn!(%client, "Rate limit exceeded");
            let body = serde_json::json!({ "ok": false, "err": "Too many requests" });
            return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        }
    }

    next.run(req).await
}

/// Peer address first, then `X-Forwarded-For`, then `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(peer) = peer {
        return Some(peer.ip());
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
