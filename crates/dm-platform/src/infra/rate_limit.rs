//! Per-client request rate limiting
//!
//! A keyed governor limiter; the key is the client address taken from
//! proxy headers.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dm_config::RateLimitSettings;
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

use crate::error::DotMacError;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub const UNKNOWN_CLIENT: &str = "unknown";

/// First `X-Forwarded-For` hop, then `X-Real-IP`, else `unknown`
pub fn client_key(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

impl ClientRateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_minute).unwrap_or(nonzero!(60u32));
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(rate).allow_burst(burst)),
            clock: DefaultClock::default(),
        }
    }

    /// `None` when rate limiting is disabled
    pub fn from_settings(settings: &RateLimitSettings) -> Option<Arc<Self>> {
        settings
            .enabled
            .then(|| Arc::new(Self::new(settings.requests_per_minute, settings.burst)))
    }

    /// `Err(seconds to wait)` when the client is over its quota
    pub fn check(&self, key: &str) -> std::result::Result<(), u64> {
        self.limiter.check_key(&key.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            wait.as_secs().max(1)
        })
    }

    /// Drop idle per-client state
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<ClientRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(request.headers());
    match limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            debug!(client = %key, retry_after_secs, "Request rate limited");
            metrics::counter!("dm_rate_limited_total").increment(1);
            DotMacError::RateLimited { retry_after_secs }.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_key(&headers), "10.0.0.2");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_key(&headers), "203.0.113.7");
    }

    #[test]
    fn test_burst_then_limited_per_client() {
        let limiter = ClientRateLimiter::new(60, 2);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        let wait = limiter.check("a").unwrap_err();
        assert!(wait >= 1);

        // Other clients have their own bucket
        assert!(limiter.check("b").is_ok());
    }

    #[test]
    fn test_disabled_settings() {
        let settings = RateLimitSettings {
            enabled: false,
            requests_per_minute: 10,
            burst: 5,
        };
        assert!(ClientRateLimiter::from_settings(&settings).is_none());
    }
}
