//! Per-client rate limiting: a continuous-refill token bucket and the registry
//! that owns one bucket per client identity.
//!
//! The registry keeps every [`ClientEntry`] behind a single mutex covering the
//! whole map. Lookup, creation, the `last_seen` update, token consumption and
//! sweeping all happen under that lock, and the lock is always released before
//! [`ClientRegistry::check`] returns, so callers never hold it while the rest
//! of the request is processed. [`TokenBucket`] itself is lock free and is only
//! ever touched through the registry.
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use axum::extract::ConnectInfo;
use http::{HeaderMap, Request};
use tokio::{task::JoinHandle, time::Instant};

use crate::config::models::LimiterConfig;

/// How often the background sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Entries untouched for longer than this are evicted by the sweeper.
pub const MAX_IDLE: Duration = Duration::from_secs(180);

/// Token bucket refilled continuously at `rate` tokens per second up to
/// `burst` tokens. A fresh bucket starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    pub fn new_at(rate: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst);
        Self {
            rate: rate.max(0.0),
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    /// Consume one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        // Readings older than the last refill (possible across threads) add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Limiter state for one client identity.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub limiter: TokenBucket,
    pub last_seen: Instant,
}

/// Concurrent map from client identity to limiter state.
///
/// Construct with [`ClientRegistry::start`] to get the periodic sweeper, or
/// with [`ClientRegistry::new`] for a passive registry (tests, tooling).
#[derive(Debug)]
pub struct ClientRegistry {
    rate: f64,
    burst: u32,
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            rate: config.rps,
            burst: config.burst,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Build a shared registry and start its sweeper. The sweeper runs every
    /// [`SWEEP_INTERVAL`] for as long as the registry is alive.
    pub fn start(config: &LimiterConfig) -> Arc<Self> {
        let registry = Arc::new(Self::new(config));
        registry.spawn_sweeper();
        registry
    }

    /// Record a request from `identity` and decide whether it may proceed.
    pub fn check(&self, identity: &str) -> bool {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> bool {
        let mut clients = self.lock();

        let entry = clients
            .entry(identity.to_string())
            .or_insert_with(|| ClientEntry {
                limiter: TokenBucket::new_at(self.rate, self.burst, now),
                last_seen: now,
            });

        if now > entry.last_seen {
            entry.last_seen = now;
        }
        entry.limiter.allow_at(now)
    }

    /// Drop every entry idle for longer than `max_idle`. Returns how many were removed.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        self.sweep_at(Instant::now(), max_idle)
    }

    pub fn sweep_at(&self, now: Instant, max_idle: Duration) -> usize {
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= max_idle);
        before - clients.len()
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.lock().contains_key(identity)
    }

    /// Snapshot of one client's state.
    pub fn entry(&self, identity: &str) -> Option<ClientEntry> {
        self.lock().get(identity).cloned()
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep(MAX_IDLE);
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = registry.len(),
                        "Evicted idle rate limiter entries"
                    );
                }
            }
            tracing::debug!("Client registry dropped, sweeper exiting");
        })
    }

    // Bucket arithmetic cannot leave the map half-updated, so a poisoned lock
    // still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientEntry>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Derive a stable identity for the client that sent `req`.
///
/// Prefers the first address in `X-Forwarded-For`, then `X-Real-IP`, then the
/// peer address recorded by the server. `None` means the request cannot be
/// attributed to any client.
pub fn client_identity<T>(req: &Request<T>) -> Option<String> {
    if let Some(ip) = forwarded_ip(req.headers()) {
        return Some(ip.to_string());
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let first_forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());

    first_forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use http::Method;

    use super::*;

    fn limiter_config(rps: f64, burst: u32) -> LimiterConfig {
        LimiterConfig {
            enabled: true,
            rps,
            burst,
        }
    }

    #[test]
    fn bucket_starts_full_and_empties() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new_at(1.0, 3, now);

        assert!(bucket.allow_at(now));
        assert!(bucket.allow_at(now));
        assert!(bucket.allow_at(now));
        assert!(!bucket.allow_at(now));
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn bucket_refills_continuously_up_to_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(2.0, 4, start);
        for _ in 0..4 {
            assert!(bucket.allow_at(start));
        }

        // half a second at 2 rps is exactly one token
        let later = start + Duration::from_millis(500);
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));

        // a long pause never overfills the bucket
        let much_later = later + Duration::from_secs(60);
        assert!(bucket.allow_at(much_later));
        assert!(bucket.tokens() <= 4.0);
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn bucket_ignores_clock_readings_from_the_past() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1.0, 1, start + Duration::from_secs(1));
        assert!(bucket.allow_at(start + Duration::from_secs(1)));
        assert!(!bucket.allow_at(start));
        assert!(bucket.tokens() >= 0.0);
    }

    #[test]
    fn zero_burst_denies_everything() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new_at(100.0, 0, now);
        assert!(!bucket.allow_at(now));
        assert!(!bucket.allow_at(now + Duration::from_secs(10)));
    }

    #[test]
    fn successes_never_exceed_burst_plus_refill() {
        let cases = [(1.0, 1_u32, 100_u64), (2.0, 4, 50), (10.0, 5, 7), (0.5, 3, 333)];

        for (rate, burst, spacing_ms) in cases {
            let start = Instant::now();
            let mut bucket = TokenBucket::new_at(rate, burst, start);
            let delta = Duration::from_millis(spacing_ms);

            let mut successes_at = Vec::new();
            for i in 0..500_u32 {
                let now = start + delta * i;
                if bucket.allow_at(now) {
                    successes_at.push(now);
                }
                assert!(bucket.tokens() >= 0.0 && bucket.tokens() <= f64::from(burst));
            }

            // every window [successes_at[i], successes_at[j]] obeys b + r·W
            for i in 0..successes_at.len() {
                for j in i..successes_at.len() {
                    let window = (successes_at[j] - successes_at[i]).as_secs_f64();
                    let count = (j - i + 1) as f64;
                    assert!(
                        count <= f64::from(burst) + rate * window + 1e-9,
                        "rate={rate} burst={burst} spacing={spacing_ms}ms: {count} successes in {window}s"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn registry_creates_one_entry_per_identity() {
        let registry = ClientRegistry::new(&limiter_config(1.0, 2));
        let now = Instant::now();

        assert!(registry.check_at("10.0.0.1", now));
        assert!(registry.check_at("10.0.0.1", now));
        assert!(!registry.check_at("10.0.0.1", now));
        assert!(registry.check_at("10.0.0.2", now));

        assert_eq!(registry.len(), 2);
        let entry = registry.entry("10.0.0.1").unwrap();
        assert_eq!(entry.last_seen, now);
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_a_single_entry() {
        let registry = Arc::new(ClientRegistry::new(&limiter_config(0.0, 8)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.check("192.168.1.7"))
            })
            .collect();
        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        // one shared bucket: exactly `burst` successes, never 16
        assert_eq!(allowed, 8);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_entries() {
        let registry = ClientRegistry::new(&limiter_config(1.0, 1));
        let start = Instant::now();

        registry.check_at("stale", start);
        registry.check_at("fresh", start + Duration::from_secs(120));

        let removed = registry.sweep_at(start + Duration::from_secs(181), MAX_IDLE);
        assert_eq!(removed, 1);
        assert!(!registry.contains("stale"));
        assert!(registry.contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_every_minute() {
        let registry = ClientRegistry::start(&limiter_config(1.0, 1));
        registry.check("idle-client");
        tokio::time::sleep(Duration::from_secs(150)).await;
        registry.check("active-client");

        // the 4 minute tick sees idle-client untouched for 240s and active-client for 90s
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert!(!registry.contains("idle-client"));
        assert!(registry.contains("active-client"));
    }

    #[test]
    fn identity_prefers_forwarded_headers() {
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        let mut req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
            .header("X-Real-IP", "198.51.100.2")
            .body(())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_identity(&req).as_deref(), Some("203.0.113.9"));

        let mut req = Request::builder()
            .uri("/")
            .header("X-Forwarded-For", "garbage")
            .header("X-Real-IP", "198.51.100.2")
            .body(())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_identity(&req).as_deref(), Some("198.51.100.2"));

        let mut req = Request::builder().uri("/").body(()).unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_identity(&req).as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn identity_is_none_without_any_origin_information() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(client_identity(&req).is_none());
    }
}
