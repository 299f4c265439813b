//! Per-IP rate limiting
//!
//! Fixed 60-second windows keyed by (route class, client IP), held in
//! process memory. kiln is single-replica for admission purposes; running
//! multiple API replicas requires IP affinity at the load balancer, since
//! per-replica windows would under-count.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

const WINDOW: Duration = Duration::from_secs(60);

/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets
    pub reset_s: u64,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter store.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, IpAddr), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `(route, ip)` and decide.
    pub fn check(&self, route: &str, ip: IpAddr, limit: u32) -> RateDecision {
        self.check_at(route, ip, limit, Instant::now())
    }

    fn check_at(&self, route: &str, ip: IpAddr, limit: u32, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows
            .entry((route.to_string(), ip))
            .or_insert(Window { started: now, count: 0 });

        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }

        let reset_s = WINDOW
            .saturating_sub(now.duration_since(window.started))
            .as_secs()
            .max(1);

        if window.count >= limit {
            return RateDecision { allowed: false, limit, remaining: 0, reset_s };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - window.count,
            reset_s,
        }
    }
}

/// Resolve the client IP: X-Forwarded-For (first hop) when the deployment
/// says to trust it, else the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return forwarded;
        }
    }
    peer.unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_limit_enforced_within_window() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for i in 0..10 {
            let d = limiter.check_at("batches", ip(1), 10, now);
            assert!(d.allowed, "request {} should pass", i);
        }
        let d = limiter.check_at("batches", ip(1), 10, now);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.reset_s >= 1);
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..10 {
            limiter.check_at("batches", ip(1), 10, now);
        }
        assert!(!limiter.check_at("batches", ip(1), 10, now).allowed);

        let later = now + Duration::from_secs(61);
        assert!(limiter.check_at("batches", ip(1), 10, later).allowed);
    }

    #[test]
    fn test_ips_and_routes_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..10 {
            limiter.check_at("batches", ip(1), 10, now);
        }
        assert!(!limiter.check_at("batches", ip(1), 10, now).allowed);
        // Different IP, same route
        assert!(limiter.check_at("batches", ip(2), 10, now).allowed);
        // Same IP, different route
        assert!(limiter.check_at("files", ip(1), 20, now).allowed);
    }

    #[test]
    fn test_client_ip_resolution() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());

        let peer = Some(ip(5));
        assert_eq!(client_ip(&headers, peer, true), "203.0.113.9".parse::<IpAddr>().unwrap());
        // Untrusted: header ignored
        assert_eq!(client_ip(&headers, peer, false), ip(5));
        assert_eq!(client_ip(&HeaderMap::new(), None, true), IpAddr::from([127, 0, 0, 1]));
    }
}
