//! Probe Runner
//!
//! One probe = one request to an endpoint while some engine configuration is
//! live. Network trouble never escapes as `Err`: every outcome is folded into
//! a [`ProbeResult`].

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::increment_counter;
use serde::Serialize;
use tokio::{
    sync::Mutex,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, trace};

use crate::{
    config::BlockcheckSettings,
    error::{ManagerError, Result},
    types::{CheckKind, Endpoint, ProbeResult, StrategyId, TlsVersion},
};

// ── Transport ──────────────────────────────────────────────────────────────

/// Raw result of one network attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// HTTP status line and headers arrived
    Response { status: u16, location: Option<String> },
    /// QUIC handshake completed
    Handshake,
    TimedOut,
    /// Reset, refused, TLS alert and the like
    Failed(String),
}

/// Issues the actual request; swapped for a fake in tests
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        endpoint: &Endpoint,
        check: CheckKind,
        addr: IpAddr,
        timeout: Duration,
    ) -> TransportOutcome;
}

/// reqwest for HTTP(S), quinn for the QUIC handshake
pub struct HttpTransport {
    user_agent: String,
    quic: quinn::ClientConfig,
}

impl HttpTransport {
    pub fn new(user_agent: impl Into<String>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        crypto.alpn_protocols = vec![b"h3".to_vec()];

        Self {
            user_agent: user_agent.into(),
            quic: quinn::ClientConfig::new(Arc::new(crypto)),
        }
    }

    fn client(
        &self,
        endpoint: &Endpoint,
        check: CheckKind,
        addr: IpAddr,
        timeout: Duration,
    ) -> reqwest::Result<reqwest::Client> {
        use reqwest::tls::Version;

        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .resolve(&endpoint.host, SocketAddr::new(addr, check.port()));

        builder = match check.tls_version() {
            Some(TlsVersion::Tls12) => builder
                .min_tls_version(Version::TLS_1_2)
                .max_tls_version(Version::TLS_1_2),
            Some(TlsVersion::Tls13) => builder.min_tls_version(Version::TLS_1_3),
            None => builder,
        };
        builder.build()
    }

    async fn http(&self, endpoint: &Endpoint, check: CheckKind, addr: IpAddr, timeout: Duration) -> TransportOutcome {
        let client = match self.client(endpoint, check, addr, timeout) {
            Ok(c) => c,
            Err(e) => return TransportOutcome::Failed(format!("client setup: {}", e)),
        };
        match client.get(endpoint.url(check)).send().await {
            Ok(resp) => TransportOutcome::Response {
                status: resp.status().as_u16(),
                location: resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            },
            Err(e) if e.is_timeout() => TransportOutcome::TimedOut,
            Err(e) => TransportOutcome::Failed(error_chain(&e)),
        }
    }

    async fn quic(&self, endpoint: &Endpoint, addr: IpAddr) -> TransportOutcome {
        let bind: SocketAddr = match addr {
            IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let mut quic_endpoint = match quinn::Endpoint::client(bind) {
            Ok(e) => e,
            Err(e) => return TransportOutcome::Failed(format!("udp socket: {}", e)),
        };
        quic_endpoint.set_default_client_config(self.quic.clone());

        let connecting = match quic_endpoint.connect(SocketAddr::new(addr, 443), &endpoint.host) {
            Ok(c) => c,
            Err(e) => return TransportOutcome::Failed(e.to_string()),
        };
        let outcome = match connecting.await {
            Ok(conn) => {
                conn.close(0u32.into(), b"probe done");
                TransportOutcome::Handshake
            }
            Err(quinn::ConnectionError::TimedOut) => TransportOutcome::TimedOut,
            Err(e) => TransportOutcome::Failed(e.to_string()),
        };
        quic_endpoint.close(0u32.into(), b"");
        outcome
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        endpoint: &Endpoint,
        check: CheckKind,
        addr: IpAddr,
        timeout: Duration,
    ) -> TransportOutcome {
        match check {
            CheckKind::Http3 => self.quic(endpoint, addr).await,
            _ => self.http(endpoint, check, addr, timeout).await,
        }
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

/// Decide success or failure from a transport outcome
pub fn classify(outcome: &TransportOutcome, host: &str) -> std::result::Result<(), String> {
    match outcome {
        TransportOutcome::Handshake => Ok(()),
        TransportOutcome::TimedOut => Err("timed out".to_string()),
        TransportOutcome::Failed(e) => Err(e.clone()),
        TransportOutcome::Response { status: 400, .. } => {
            Err("HTTP 400 bad request: server likely received the fake packets".to_string())
        }
        TransportOutcome::Response { status, location } if (300..400).contains(status) => {
            let legit = location
                .as_deref()
                .and_then(|l| url::Url::parse(l).ok().map(|u| (u, l)))
                .map(|(u, l)| matches!(u.scheme(), "http" | "https") && l.contains(host))
                .unwrap_or(false);
            if legit {
                Ok(())
            } else {
                Err(format!(
                    "suspicious redirect to {}",
                    location.as_deref().unwrap_or("<no location>")
                ))
            }
        }
        TransportOutcome::Response { .. } => Ok(()),
    }
}

// ── DNS cache ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DnsStats {
    pub hits: u64,
    pub misses: u64,
}

impl DnsStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / total as f64
        }
    }
}

/// Host → IPv4 address cache with a fixed TTL
pub struct DnsCache {
    ttl: Duration,
    entries: DashMap<String, (IpAddr, Instant)>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: DashMap::new(), hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    /// Pin `host` to `addr` for one TTL
    pub fn seed(&self, host: &str, addr: IpAddr) {
        self.entries.insert(host.to_ascii_lowercase(), (addr, Instant::now() + self.ttl));
    }

    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        let key = host.to_ascii_lowercase();
        if let Some(entry) = self.entries.get(&key) {
            if Instant::now() < entry.1 {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.0);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let addr = tokio::net::lookup_host((key.as_str(), 0))
            .await
            .ok()?
            .map(|sa| sa.ip())
            .find(IpAddr::is_ipv4)?;
        trace!("🔍 {} → {}", key, addr);
        self.entries.insert(key, (addr, Instant::now() + self.ttl));
        Some(addr)
    }

    pub fn stats(&self) -> DnsStats {
        DnsStats { hits: self.hits.load(Ordering::Relaxed), misses: self.misses.load(Ordering::Relaxed) }
    }
}

// ── Rate limiter ───────────────────────────────────────────────────────────

/// Token bucket gating request starts
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    /// A non-positive refill rate disables limiting
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self { capacity, refill_per_sec, state: Mutex::new((capacity, Instant::now())) }
    }

    pub async fn acquire(&self) {
        if self.refill_per_sec <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.1).as_secs_f64();
                state.0 = (state.0 + elapsed * self.refill_per_sec).min(self.capacity);
                state.1 = now;
                if state.0 >= 1.0 {
                    state.0 -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.0) / self.refill_per_sec)
            };
            sleep(wait).await;
        }
    }
}

// ── Runner ─────────────────────────────────────────────────────────────────

pub struct ProbeRunner {
    transport: Arc<dyn Transport>,
    dns: Arc<DnsCache>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    repeats: u32,
}

impl ProbeRunner {
    pub fn new(transport: Arc<dyn Transport>, settings: &BlockcheckSettings) -> Self {
        Self {
            transport,
            dns: Arc::new(DnsCache::new(Duration::from_secs(settings.dns_ttl_secs))),
            limiter: Arc::new(RateLimiter::new(settings.rate_capacity, settings.rate_refill_per_sec)),
            timeout: Duration::from_millis(settings.timeout_ms),
            repeats: settings.repeats.max(1),
        }
    }

    pub fn with_dns(mut self, dns: Arc<DnsCache>) -> Self {
        self.dns = dns;
        self
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    /// Probe `endpoint` under whatever engine configuration is live.
    /// Repeats stop at the first failure; otherwise the fastest time is kept.
    pub async fn probe(&self, strategy: Option<StrategyId>, endpoint: &Endpoint, check: CheckKind) -> ProbeResult {
        increment_counter!("zapret_probes_total");
        let mut fastest: Option<Duration> = None;

        for _ in 0..self.repeats {
            match self.attempt(endpoint, check).await {
                Ok(elapsed) => {
                    fastest = Some(fastest.map_or(elapsed, |f| f.min(elapsed)));
                }
                Err(reason) => {
                    increment_counter!("zapret_probe_failures_total");
                    debug!("❌ {} [{}]: {}", endpoint, check, reason);
                    return ProbeResult::failed(strategy, endpoint.clone(), check, reason);
                }
            }
        }

        let latency = fastest.unwrap_or_default();
        debug!("✅ {} [{}] in {:?}", endpoint, check, latency);
        ProbeResult::passed(strategy, endpoint.clone(), check, latency)
    }

    async fn attempt(&self, endpoint: &Endpoint, check: CheckKind) -> std::result::Result<Duration, String> {
        self.limiter.acquire().await;

        let addr = self
            .dns
            .resolve(&endpoint.host)
            .await
            .ok_or_else(|| format!("could not resolve host '{}'", endpoint.host))?;

        let started = Instant::now();
        let outcome = timeout(self.timeout, self.transport.request(endpoint, check, addr, self.timeout))
            .await
            .unwrap_or(TransportOutcome::TimedOut);

        if outcome == TransportOutcome::TimedOut {
            return Err(ManagerError::NetworkTimeout(self.timeout.as_millis() as u64).to_string());
        }
        classify(&outcome, &endpoint.host)?;
        Ok(started.elapsed())
    }
}

/// Settings-driven runner over the real network
pub fn default_runner(settings: &BlockcheckSettings) -> Result<ProbeRunner> {
    if settings.timeout_ms == 0 {
        return Err(ManagerError::config("blockcheck.timeout_ms must be positive"));
    }
    Ok(ProbeRunner::new(Arc::new(HttpTransport::new(settings.user_agent.clone())), settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, net::Ipv4Addr, sync::Mutex as StdMutex};
    use tokio_test::{assert_err, assert_ok};

    /// Scripted transport: fixed outcome per host, optional per-call queue
    struct ScriptedTransport {
        outcomes: HashMap<String, TransportOutcome>,
        queue: StdMutex<Vec<TransportOutcome>>,
        calls: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(pairs: &[(&str, TransportOutcome)]) -> Self {
            Self {
                outcomes: pairs.iter().map(|(h, o)| (h.to_string(), o.clone())).collect(),
                queue: StdMutex::new(Vec::new()),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(&self, endpoint: &Endpoint, _: CheckKind, _: IpAddr, _: Duration) -> TransportOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.queue.lock().unwrap().pop() {
                return next;
            }
            self.outcomes
                .get(&endpoint.host)
                .cloned()
                .unwrap_or(TransportOutcome::Failed("connection refused".into()))
        }
    }

    fn settings(repeats: u32) -> BlockcheckSettings {
        BlockcheckSettings { repeats, rate_refill_per_sec: 0.0, timeout_ms: 200, ..Default::default() }
    }

    fn runner(transport: Arc<dyn Transport>, repeats: u32, hosts: &[&str]) -> ProbeRunner {
        let r = ProbeRunner::new(transport, &settings(repeats));
        for h in hosts {
            r.dns().seed(h, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        }
        r
    }

    fn ok200() -> TransportOutcome {
        TransportOutcome::Response { status: 200, location: None }
    }

    #[test]
    fn test_classify() {
        assert_ok!(classify(&ok200(), "a.com"));
        assert_ok!(classify(&TransportOutcome::Handshake, "a.com"));
        assert_err!(classify(&TransportOutcome::Response { status: 400, location: None }, "a.com"));
        assert_err!(classify(&TransportOutcome::TimedOut, "a.com"));
        assert_ok!(classify(
            &TransportOutcome::Response { status: 301, location: Some("https://a.com/forum/".into()) },
            "a.com"
        ));
        let blockpage = TransportOutcome::Response {
            status: 302,
            location: Some("http://warning.rt.ru/?id=17".into()),
        };
        assert!(classify(&blockpage, "a.com").unwrap_err().contains("suspicious redirect"));
        assert_err!(classify(
            &TransportOutcome::Response { status: 302, location: Some("/relative".into()) },
            "a.com"
        ));
        assert_ok!(classify(&TransportOutcome::Response { status: 404, location: None }, "a.com"));
    }

    #[tokio::test]
    async fn test_same_probe_twice_same_classification() {
        let transport = Arc::new(ScriptedTransport::new(&[
            ("good.com", ok200()),
            ("bad.com", TransportOutcome::Failed("connection reset by peer".into())),
        ]));
        let runner = runner(transport, 1, &["good.com", "bad.com"]);
        for host in ["good.com", "bad.com"] {
            let ep: Endpoint = host.parse().unwrap();
            let first = runner.probe(Some(StrategyId::Catalog(0)), &ep, CheckKind::HttpsTls13).await;
            let second = runner.probe(Some(StrategyId::Catalog(0)), &ep, CheckKind::HttpsTls13).await;
            assert_eq!(first.success, second.success);
            assert_eq!(first.error, second.error);
        }
    }

    #[tokio::test]
    async fn test_connection_reset_is_failure() {
        let transport = Arc::new(ScriptedTransport::new(&[(
            "rutracker.org",
            TransportOutcome::Failed("connection reset by peer (os error 104)".into()),
        )]));
        let runner = runner(transport, 1, &["rutracker.org"]);
        let ep: Endpoint = "rutracker.org/forum/index.php".parse().unwrap();
        let result = runner.probe(None, &ep, CheckKind::Http).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("reset"));
        assert_eq!(result.strategy, None);
    }

    #[tokio::test]
    async fn test_repeats_first_failure_wins() {
        let transport = Arc::new(ScriptedTransport::new(&[("a.com", ok200())]));
        // popped from the back: success, then reset
        *transport.queue.lock().unwrap() = vec![TransportOutcome::Failed("reset".into()), ok200()];
        let runner = runner(transport.clone(), 3, &["a.com"]);
        let result = runner.probe(None, &"a.com".parse().unwrap(), CheckKind::Http).await;
        assert!(!result.success);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeats_all_pass() {
        let transport = Arc::new(ScriptedTransport::new(&[("a.com", ok200())]));
        let runner = runner(transport.clone(), 3, &["a.com"]);
        let result = runner.probe(None, &"a.com".parse().unwrap(), CheckKind::Http).await;
        assert!(result.success);
        assert!(result.latency.is_some());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn request(&self, _: &Endpoint, _: CheckKind, _: IpAddr, _: Duration) -> TransportOutcome {
            sleep(Duration::from_secs(5)).await;
            TransportOutcome::Handshake
        }
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let runner = runner(Arc::new(SlowTransport), 1, &["slow.com"]);
        let result = runner.probe(None, &"slow.com".parse().unwrap(), CheckKind::Http3).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dns_cache_hits() {
        let cache = DnsCache::new(Duration::from_secs(300));
        cache.seed("Example.com", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cache.resolve("example.com").await, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(cache.resolve("EXAMPLE.com").await, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(cache.stats(), DnsStats { hits: 2, misses: 0 });
        assert_eq!(cache.stats().hit_rate(), 100.0);
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_for_refill() {
        let limiter = RateLimiter::new(1, 20.0);
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
