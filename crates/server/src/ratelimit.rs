//! Per-client token bucket rate limiting for the planning endpoint.
//!
//! Each client identity (normally its IP address) gets one bucket, created on
//! first use. Only chunk planning is limited; downloads are not.
//!
//! # Memory Safety
//!
//! The identity map cannot grow without bound:
//! - New identities beyond `max_entries` are rejected until cleanup runs
//! - Identities idle for longer than the TTL are evicted by a background task
//!
//! # Security Note
//!
//! X-Forwarded-For and X-Real-IP are ignored unless the connection comes from
//! one of the configured `trusted_proxies`:
//!
//! - Empty list (default): only the direct connection IP is used
//! - List of IPs/CIDRs: headers trusted only from these addresses
//! - ["*"]: headers trusted from everyone (development only)

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::{DashMap, mapref::entry::Entry};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState,
};
use ipnet::IpNet;
use patcher_core::config::RateLimitConfig;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

type KeyedLimiter =
    RateLimiter<String, DashMap<String, InMemoryState>, DefaultClock, NoOpMiddleware>;

/// Identity used when the peer address is unknown.
const UNKNOWN_IDENTITY: &str = "unknown";

/// Evictions must reach this fraction of the tracked identities before the
/// governor map is rebuilt.
const REBUILD_EVICTION_THRESHOLD_FRACTION: f64 = 0.10;

/// Evictions at or above this count always trigger a rebuild.
const REBUILD_EVICTION_MIN_COUNT: usize = 100;

/// A rebuild happens at least this often while evictions keep occurring.
const REBUILD_MIN_INTERVAL: Duration = Duration::from_secs(300);

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    inner: Option<Arc<RateLimitStateInner>>,
}

struct RateLimitStateInner {
    /// Governor map, behind a lock so it can be swapped out on rebuild.
    limiter: RwLock<KeyedLimiter>,
    /// Last time each identity was seen.
    last_access: DashMap<String, Instant>,
    trusted_proxies: TrustedProxies,
    max_entries: u32,
    entry_ttl: Duration,
    quota: Quota,
    connect_info_warned: AtomicBool,
    at_capacity_warned: AtomicBool,
    last_rebuild: RwLock<Instant>,
}

#[derive(Clone, Debug)]
enum TrustedEntry {
    Ip(IpAddr),
    Cidr(IpNet),
}

#[derive(Clone, Debug)]
enum TrustedProxies {
    None,
    All,
    List(Vec<TrustedEntry>),
}

impl TrustedProxies {
    fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            return Self::None;
        }
        if proxies.len() == 1 && proxies[0] == "*" {
            return Self::All;
        }

        let entries = proxies
            .iter()
            .filter_map(|p| {
                let parsed = if p.contains('/') {
                    p.parse::<IpNet>().map(TrustedEntry::Cidr).map_err(|e| e.to_string())
                } else {
                    p.parse::<IpAddr>().map(TrustedEntry::Ip).map_err(|e| e.to_string())
                };
                parsed
                    .inspect_err(|e| tracing::warn!(entry = %p, error = %e, "Ignoring invalid trusted proxy"))
                    .ok()
            })
            .collect();
        Self::List(entries)
    }

    fn is_trusted(&self, connection_ip: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(entries) => {
                let Ok(ip) = connection_ip.parse::<IpAddr>() else {
                    return false;
                };
                entries.iter().any(|entry| match entry {
                    TrustedEntry::Ip(trusted) => *trusted == ip,
                    TrustedEntry::Cidr(network) => network.contains(&ip),
                })
            }
        }
    }
}

impl RateLimitState {
    /// Create the limiter from configuration. Disabled config yields a no-op limiter.
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }

        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            inner: Some(Arc::new(RateLimitStateInner {
                limiter: RwLock::new(RateLimiter::dashmap(quota)),
                last_access: DashMap::new(),
                trusted_proxies: TrustedProxies::from_config(&config.trusted_proxies),
                max_entries: config.max_entries,
                entry_ttl: Duration::from_secs(config.entry_ttl_secs),
                quota,
                connect_info_warned: AtomicBool::new(false),
                at_capacity_warned: AtomicBool::new(false),
                last_rebuild: RwLock::new(Instant::now()),
            })),
        }
    }

    /// Whether limiting is active.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Take one token from `identity`'s bucket.
    pub fn check(&self, identity: &str) -> Result<(), RateLimitError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let now = Instant::now();
        let key = identity.to_string();

        // len() must not be called while holding an entry lock.
        let current_len = inner.last_access.len();
        let at_capacity = current_len >= inner.max_entries as usize;

        match inner.last_access.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                if at_capacity {
                    if !inner.at_capacity_warned.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            current_entries = current_len,
                            max_entries = inner.max_entries,
                            "Rate limiter at capacity, rejecting new clients until cleanup"
                        );
                    }
                    return Err(RateLimitError {
                        retry_after_secs: 60,
                        reason: RateLimitReason::AtCapacity,
                    });
                }
                entry.insert(now);
            }
        }

        let limiter = inner.limiter.read().unwrap_or_else(|poisoned| {
            tracing::warn!("rate limiter RwLock was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        });
        limiter.check_key(&key).map_err(|not_until| {
            let wait = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
            RateLimitError {
                retry_after_secs: wait.as_secs() + 1,
                reason: RateLimitReason::RateLimited,
            }
        })
    }

    /// Boolean form of [`check`](Self::check).
    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity).is_ok()
    }

    /// Evict identities idle longer than the TTL, returning how many were evicted.
    ///
    /// Governor's map cannot drop single keys, so after a large enough eviction
    /// the whole limiter is rebuilt. That resets the buckets of active clients,
    /// which is why small evictions are left alone until the rebuild interval
    /// has passed.
    pub fn cleanup(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };

        let now = Instant::now();
        let ttl = inner.entry_ttl;
        let stale: Vec<String> = inner
            .last_access
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        // remove_if re-checks so a client seen since collection is kept.
        let evicted = stale
            .iter()
            .filter(|key| {
                inner
                    .last_access
                    .remove_if(*key, |_, last| now.duration_since(*last) > ttl)
                    .is_some()
            })
            .count();

        if evicted == 0 {
            return 0;
        }

        let before = inner.last_access.len() + evicted;
        if Self::should_rebuild(inner, evicted, before, now) {
            let mut limiter = inner.limiter.write().unwrap_or_else(|poisoned| {
                tracing::warn!("rate limiter RwLock was poisoned during rebuild, recovering");
                poisoned.into_inner()
            });
            *limiter = RateLimiter::dashmap(inner.quota);
            let mut last = inner.last_rebuild.write().unwrap_or_else(|p| p.into_inner());
            *last = Instant::now();
            tracing::debug!(evicted, remaining = inner.last_access.len(), "Rebuilt rate limiter");
        }

        inner.at_capacity_warned.store(false, Ordering::Relaxed);
        tracing::debug!(
            evicted,
            remaining = inner.last_access.len(),
            "Rate limiter cleanup completed"
        );
        evicted
    }

    fn should_rebuild(
        inner: &RateLimitStateInner,
        evicted: usize,
        before: usize,
        now: Instant,
    ) -> bool {
        let threshold = ((before as f64 * REBUILD_EVICTION_THRESHOLD_FRACTION) as usize)
            .max(REBUILD_EVICTION_MIN_COUNT);
        if evicted >= threshold {
            return true;
        }
        let last = inner.last_rebuild.read().unwrap_or_else(|p| p.into_inner());
        now.duration_since(*last) >= REBUILD_MIN_INTERVAL
    }

    /// Number of tracked identities.
    pub fn entry_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.last_access.len())
    }

    fn warn_connect_info_missing(&self) {
        if let Some(inner) = &self.inner
            && !inner.connect_info_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "ConnectInfo not available for rate limiting. All clients share the 'unknown' \
                 bucket. Serve with .into_make_service_with_connect_info::<SocketAddr>()."
            );
        }
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// The client's bucket is empty.
    RateLimited,
    /// Too many distinct clients are tracked.
    AtCapacity,
}

/// Rejection returned as `429 Too Many Requests`.
#[derive(Debug)]
pub struct RateLimitError {
    /// Seconds until a token is available.
    pub retry_after_secs: u64,
    pub reason: RateLimitReason,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let (code, message) = match self.reason {
            RateLimitReason::RateLimited => (
                "rate_limit_exceeded",
                format!(
                    "Rate limit exceeded. Retry after {} seconds.",
                    self.retry_after_secs
                ),
            ),
            RateLimitReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "Server is experiencing high load. Please retry later.".to_string(),
            ),
        };

        let body = serde_json::json!({
            "code": code,
            "message": message,
            "retry_after": self.retry_after_secs,
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            axum::Json(body),
        )
            .into_response()
    }
}

fn extract_forwarded_ip(req: &Request<Body>) -> Option<String> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(s) = forwarded.to_str()
        && let Some(ip) = s.split(',').next()
    {
        return Some(ip.trim().to_string());
    }

    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// Resolve the client identity of a request.
///
/// Forwarded headers are only honored when the direct peer is a trusted proxy.
pub fn extract_ip(req: &Request<Body>, state: &RateLimitState) -> String {
    let Some(inner) = &state.inner else {
        return UNKNOWN_IDENTITY.to_string();
    };

    let connection_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    let trust_headers = match &connection_ip {
        Some(ip) => inner.trusted_proxies.is_trusted(ip),
        None => matches!(inner.trusted_proxies, TrustedProxies::All),
    };

    if trust_headers && let Some(forwarded) = extract_forwarded_ip(req) {
        return forwarded;
    }

    connection_ip.unwrap_or_else(|| {
        state.warn_connect_info_missing();
        UNKNOWN_IDENTITY.to_string()
    })
}

/// Per-IP rate limiting middleware for the planning route.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() {
        return next.run(req).await;
    }

    let ip = extract_ip(&req, &rate_limit);
    match rate_limit.check(&ip) {
        Ok(()) => next.run(req).await,
        Err(e) => {
            crate::metrics::PLANS_RATE_LIMITED.inc();
            tracing::debug!(client = %ip, reason = ?e.reason, "Planning request rate limited");
            e.into_response()
        }
    }
}

/// Spawn the periodic cleanup of idle identities. Stops when `cancel` fires.
pub fn spawn_cleanup_task(
    state: RateLimitState,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            let evicted = state.cleanup();
            if evicted > 0 {
                tracing::info!(evicted, "Rate limiter cleanup task evicted stale entries");
            }
        }
        tracing::debug!("Rate limiter cleanup task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests_per_minute: u32, burst_size: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            requests_per_minute,
            burst_size,
            max_entries: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_admits_everything() {
        let state = RateLimitState::new(&RateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!state.is_enabled());
        for _ in 0..100 {
            assert!(state.allow("127.0.0.1"));
        }
        assert_eq!(state.entry_count(), 0);
    }

    #[test]
    fn test_eleventh_request_in_window_is_rejected() {
        let state = RateLimitState::new(&RateLimitConfig::default());

        for i in 0..10 {
            assert!(state.allow("10.0.0.1"), "request {i} should be admitted");
        }
        let err = state.check("10.0.0.1").unwrap_err();
        assert_eq!(err.reason, RateLimitReason::RateLimited);
        assert!(err.retry_after_secs >= 1);

        // Buckets are per identity.
        assert!(state.allow("10.0.0.2"));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        // 600/min refills one token every 100ms.
        let state = RateLimitState::new(&config(600, 10));
        for _ in 0..10 {
            assert!(state.allow("10.0.0.1"));
        }
        assert!(!state.allow("10.0.0.1"));

        std::thread::sleep(Duration::from_millis(250));
        assert!(state.allow("10.0.0.1"));
    }

    #[test]
    fn test_max_entries_rejects_new_identities() {
        let state = RateLimitState::new(&RateLimitConfig {
            max_entries: 3,
            ..config(60, 5)
        });

        assert!(state.allow("1.1.1.1"));
        assert!(state.allow("2.2.2.2"));
        assert!(state.allow("3.3.3.3"));

        let err = state.check("4.4.4.4").unwrap_err();
        assert_eq!(err.reason, RateLimitReason::AtCapacity);

        assert!(state.allow("1.1.1.1"));
    }

    #[test]
    fn test_cleanup_evicts_idle_identities() {
        let state = RateLimitState::new(&RateLimitConfig {
            entry_ttl_secs: 0,
            ..config(60, 5)
        });

        assert!(state.allow("1.1.1.1"));
        assert!(state.allow("2.2.2.2"));
        assert_eq!(state.entry_count(), 2);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(state.cleanup(), 2);
        assert_eq!(state.entry_count(), 0);
    }

    #[test]
    fn test_rejection_response_has_retry_after() {
        let response = RateLimitError {
            retry_after_secs: 7,
            reason: RateLimitReason::RateLimited,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "7");
    }

    #[test]
    fn test_trusted_proxies() {
        assert!(!TrustedProxies::from_config(&[]).is_trusted("127.0.0.1"));
        assert!(TrustedProxies::from_config(&["*".to_string()]).is_trusted("anything"));

        let proxies =
            TrustedProxies::from_config(&["127.0.0.1".to_string(), "10.0.0.0/8".to_string()]);
        assert!(proxies.is_trusted("127.0.0.1"));
        assert!(proxies.is_trusted("10.255.255.255"));
        assert!(!proxies.is_trusted("192.168.1.1"));
        assert!(!proxies.is_trusted("11.0.0.1"));
    }

    fn request_from(peer: &str, forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/zip-chunks/init");
        if let Some(forwarded) = forwarded {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[test]
    fn test_extract_ip_honors_only_trusted_proxies() {
        let state = RateLimitState::new(&RateLimitConfig {
            trusted_proxies: vec!["10.0.0.0/8".to_string()],
            ..config(60, 5)
        });

        let via_proxy = request_from("10.1.2.3", Some("203.0.113.9, 10.1.2.3"));
        assert_eq!(extract_ip(&via_proxy, &state), "203.0.113.9");

        let spoofed = request_from("198.51.100.4", Some("203.0.113.9"));
        assert_eq!(extract_ip(&spoofed, &state), "198.51.100.4");
    }
}
