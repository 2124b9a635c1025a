//! Rate-limit key derivation and the route-class quota table.
//!
//! Only the key function and the limit table are this core's contract —
//! the limiter itself (which backend, which storage) is left external.
//! [`RouteLimiter`] is nonetheless provided as a working `governor`-backed
//! reference implementation, since the ambient stack carries a real rate
//! limiter regardless of what the core's contract excludes.

use std::net::IpAddr;
use std::num::NonZeroU32;

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovernorLimiter};

/// Route classes the rate-limit contract distinguishes, each with its own
/// per-minute quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// `POST /api/v1/request-consent`.
    ConsentRequest,
    /// `POST /api/consent/issue-token`, `POST /api/consent/logout`, grant/deny.
    ConsentAction,
    /// Any path that validates a presented token.
    TokenValidation,
    /// Fallback cap applied per remote IP regardless of route.
    GlobalPerIp,
}

impl RouteClass {
    /// Requests-per-minute quota for this route class.
    #[must_use]
    pub fn requests_per_minute(self) -> u32 {
        match self {
            Self::ConsentRequest => 10,
            Self::ConsentAction => 20,
            Self::TokenValidation => 60,
            Self::GlobalPerIp => 100,
        }
    }
}

/// Derive the rate-limit key for a request: `"user:<user_id>"` if an
/// authenticated user identifier is present, otherwise the remote IP's
/// string form.
#[must_use]
pub fn rate_limit_key(user_id: Option<&str>, remote_ip: IpAddr) -> String {
    match user_id {
        Some(id) if !id.is_empty() => format!("user:{id}"),
        _ => remote_ip.to_string(),
    }
}

type Limiter = GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// A `governor`-backed limiter keyed by `(route_class, rate_limit_key)`,
/// with one bucket lazily created per key. Generalizes the single
/// lazily-initialized process-wide limiter into one bucket per distinct key.
pub struct RouteLimiter {
    buckets: DashMap<(RouteClass, String), Limiter>,
}

impl RouteLimiter {
    /// An empty limiter; buckets are created on first use per key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Whether a request in `class` keyed by `key` is currently permitted.
    /// Creates the bucket for `(class, key)` on first call.
    #[must_use]
    pub fn check(&self, class: RouteClass, key: &str) -> bool {
        let entry = self
            .buckets
            .entry((class, key.to_string()))
            .or_insert_with(|| {
                let rpm = NonZeroU32::new(class.requests_per_minute()).unwrap_or(NonZeroU32::MIN);
                GovernorLimiter::direct(Quota::per_minute(rpm))
            });
        entry.check().is_ok()
    }
}

impl Default for RouteLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefers_authenticated_user_id() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(rate_limit_key(Some("u1"), ip), "user:u1");
    }

    #[test]
    fn key_falls_back_to_remote_ip() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(rate_limit_key(None, ip), "203.0.113.7");
        assert_eq!(rate_limit_key(Some(""), ip), "203.0.113.7");
    }

    #[test]
    fn quota_table_matches_contract() {
        assert_eq!(RouteClass::ConsentRequest.requests_per_minute(), 10);
        assert_eq!(RouteClass::ConsentAction.requests_per_minute(), 20);
        assert_eq!(RouteClass::TokenValidation.requests_per_minute(), 60);
        assert_eq!(RouteClass::GlobalPerIp.requests_per_minute(), 100);
    }

    #[test]
    fn distinct_keys_get_independent_buckets() {
        let limiter = RouteLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check(RouteClass::ConsentRequest, "user:u1"));
        }
        // u1's bucket is now exhausted...
        assert!(!limiter.check(RouteClass::ConsentRequest, "user:u1"));
        // ...but a distinct key still has its own fresh bucket.
        assert!(limiter.check(RouteClass::ConsentRequest, "user:u2"));
    }
}
