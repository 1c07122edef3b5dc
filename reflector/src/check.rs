//! Request handling: gating, the per-port probe sequence and response assembly.

use challenge::ChallengeResult;
use port_probe::{parse_requested_ports, PortError, Reachability};
use reflector_core::accesslog::{now_rfc3339, AccessLogEntry, AccessSink};
use reflector_core::addr::{ip_version, is_private, resolve_client_address, Headers};
use reflector_core::ratelimiter::RateLimiter;
use reflector_core::{Rejection, Settings};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant as StdInstant;
use tls_analyze::TlsInfo;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// An HTTP request as the service sees it.
#[derive(Debug, Clone, Default)]
pub struct Inbound {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Headers,
    pub peer: Option<IpAddr>,
}

/// Query parameters of `/check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckQuery {
    pub ports: String,
    pub tls_analyze: bool,
    pub banner: bool,
    pub challenge: Option<String>,
    pub challenge_path: Option<String>,
    pub challenge_port: u16,
}

impl Default for CheckQuery {
    fn default() -> Self {
        CheckQuery {
            ports: String::new(),
            tls_analyze: true,
            banner: false,
            challenge: None,
            challenge_path: None,
            challenge_port: challenge::DEFAULT_PORT,
        }
    }
}

impl CheckQuery {
    /// `tls_analyze` is on unless exactly `false`; `banner` is off unless exactly
    /// `true`; an unusable `challenge_port` falls back to 80.
    pub fn parse(query: &str) -> Self {
        let mut q = CheckQuery::default();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match k.as_ref() {
                "ports" => q.ports = v.into_owned(),
                "tls_analyze" => q.tls_analyze = v != "false",
                "banner" => q.banner = v == "true",
                "challenge" if !v.is_empty() => q.challenge = Some(v.into_owned()),
                "challenge_path" if !v.is_empty() => q.challenge_path = Some(v.into_owned()),
                "challenge_port" => {
                    if let Ok(p) = v.trim().parse::<u16>() {
                        if p != 0 {
                            q.challenge_port = p;
                        }
                    }
                }
                _ => {}
            }
        }
        q
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortResult {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PortError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

impl PortResult {
    fn unfinished() -> Self {
        PortResult::from(Reachability { reachable: false, latency: None, error: Some(PortError::DeadlineExceeded) })
    }
}

impl From<Reachability> for PortResult {
    fn from(r: Reachability) -> Self {
        PortResult {
            reachable: r.reachable,
            latency_ms: r.latency.map(|d| d.as_millis() as u64),
            error: r.error,
            tls: None,
            challenge: None,
            banner: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResponse {
    pub success: bool,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<u8>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<u16, PortResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub status: u16,
    pub body: CheckResponse,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub version: &'static str,
    pub checks_last_hour: u64,
}

/// What to run against each reachable port.
#[derive(Debug, Clone)]
pub struct ProbePlan {
    pub tls_analyze: bool,
    pub banner: bool,
    pub challenge: Option<ChallengeSpec>,
}

#[derive(Debug, Clone)]
pub struct ChallengeSpec {
    pub token: String,
    pub path: Option<String>,
    pub port: u16,
}

impl From<&CheckQuery> for ProbePlan {
    fn from(q: &CheckQuery) -> Self {
        ProbePlan {
            tls_analyze: q.tls_analyze,
            banner: q.banner,
            challenge: q.challenge.as_ref().map(|token| ChallengeSpec {
                token: token.clone(),
                path: q.challenge_path.clone(),
                port: q.challenge_port,
            }),
        }
    }
}

/// The probing service. One instance per process, shared by every request.
pub struct Reflector {
    settings: Settings,
    limiter: RateLimiter,
    sink: Arc<dyn AccessSink>,
    started: StdInstant,
    checks: AtomicU64,
}

impl Reflector {
    pub fn new(settings: Settings, sink: Arc<dyn AccessSink>) -> Self {
        let limiter = RateLimiter::new(settings.rate_limit_per_min);
        Reflector { settings, limiter, sink, started: StdInstant::now(), checks: AtomicU64::new(0) }
    }

    /// Periodically drop all rate-limit buckets and the hourly check count.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = self.settings.cleanup_interval;
        tokio::spawn(async move {
            let mut t = tokio::time::interval_at(Instant::now() + every, every);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                t.tick().await;
                let Some(svc) = weak.upgrade() else { break };
                svc.reset_cycle();
            }
        })
    }

    pub fn reset_cycle(&self) {
        let dropped = self.limiter.tracked();
        self.limiter.reset();
        self.checks.store(0, Ordering::Relaxed);
        debug!(dropped, "rate limiter reset");
    }

    fn client(&self, req: &Inbound) -> Option<IpAddr> {
        resolve_client_address(&req.headers, req.peer, &self.settings.trusted_proxies)
    }

    /// Address checks and rate limiting shared by `/check` and `/simple`.
    fn admit(&self, client: Option<IpAddr>) -> Result<IpAddr, Rejection> {
        let ip = client.ok_or(Rejection::InvalidIp)?;
        if is_private(ip) {
            return Err(Rejection::PrivateIp);
        }
        if !self.limiter.allow(ip) {
            return Err(Rejection::RateLimited);
        }
        Ok(ip)
    }

    pub async fn handle_check(&self, req: &Inbound) -> CheckOutcome {
        let start = StdInstant::now();
        let query = CheckQuery::parse(&req.query);
        let client = self.client(req);
        let admitted = self
            .admit(client)
            .and_then(|ip| parse_requested_ports(&query.ports, &self.settings).map(|ports| (ip, ports)));

        let (ip, ports) = match admitted {
            Ok(v) => v,
            Err(rejection) => {
                let status = rejection.status();
                let mut entry = AccessLogEntry::new(client, &req.method, &req.path, status, start.elapsed());
                entry.error = Some(rejection.tag().to_string());
                self.sink.record(&entry);
                info!(error = rejection.tag(), status, "check rejected");
                return CheckOutcome {
                    status,
                    body: CheckResponse {
                        success: false,
                        client_ip: client.map(|ip| ip.to_string()).unwrap_or_default(),
                        ip_version: None,
                        timestamp: now_rfc3339(),
                        results: None,
                        error: Some(rejection.tag()),
                        message: Some(rejection.to_string()),
                    },
                };
            }
        };

        let results = self.probe_ports(ip, &ports, &ProbePlan::from(&query)).await;
        self.checks.fetch_add(1, Ordering::Relaxed);

        let mut entry = AccessLogEntry::new(Some(ip), &req.method, &req.path, 200, start.elapsed());
        entry.ports = ports;
        entry.results = results.iter().map(|(p, r)| (*p, r.reachable)).collect();
        self.sink.record(&entry);
        debug!(ports = ?entry.ports, duration_ms = entry.duration_ms, "check complete");

        CheckOutcome {
            status: 200,
            body: CheckResponse {
                success: true,
                client_ip: ip.to_string(),
                ip_version: Some(ip_version(ip)),
                timestamp: now_rfc3339(),
                results: Some(results),
                error: None,
                message: None,
            },
        }
    }

    /// Probe each port in order under one shared deadline.
    ///
    /// Reachability gates everything else. Every later step is cut off at the
    /// deadline rather than only checked between ports; a port whose turn
    /// comes after the deadline is reported unreachable with `deadline_exceeded`.
    pub async fn probe_ports(&self, ip: IpAddr, ports: &[u16], plan: &ProbePlan) -> BTreeMap<u16, PortResult> {
        let s = &self.settings;
        let deadline = Instant::now() + s.check_deadline;
        let mut results = BTreeMap::new();

        for &port in ports {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                results.insert(port, PortResult::unfinished());
                continue;
            }
            let reach = port_probe::probe(ip, port, s.timeout.min(remaining)).await;
            if !reach.reachable && Instant::now() >= deadline {
                results.insert(port, PortResult::unfinished());
                continue;
            }
            let mut result = PortResult::from(reach);
            if !result.reachable {
                results.insert(port, result);
                continue;
            }

            if plan.tls_analyze && port == s.tls_port {
                match timeout_at(deadline, tls_analyze::analyze(ip, port, s.timeout)).await {
                    Ok(Ok(info)) => result.tls = Some(info),
                    Ok(Err(e)) => debug!(port, error = %e, "tls analysis failed"),
                    Err(_) => debug!(port, "tls analysis cut off by deadline"),
                }
            }

            if let Some(ch) = plan.challenge.as_ref().filter(|c| c.port == port) {
                let verify = challenge::verify(ip, port, &ch.token, ch.path.as_deref(), s.timeout);
                result.challenge = Some(match timeout_at(deadline, verify).await {
                    Ok(r) => r,
                    Err(_) => ChallengeResult::failed(&ch.token, "deadline_exceeded", None),
                });
            }

            if plan.banner || banners::is_greeting_port(port) {
                if let Ok(b) = timeout_at(deadline, banners::grab_banner(ip, port, s.banner_timeout)).await {
                    if !b.is_empty() {
                        result.banner = Some(b);
                    }
                }
            }

            results.insert(port, result);
        }
        results
    }

    /// `/simple`: one reachability probe, answered as `yes`, `no` or `error`.
    pub async fn handle_simple(&self, req: &Inbound) -> (u16, &'static str) {
        let ip = match self.admit(self.client(req)) {
            Ok(ip) => ip,
            Err(rejection) => return (rejection.status(), "error"),
        };
        let port = url::form_urlencoded::parse(req.query.as_bytes())
            .find(|(k, _)| k == "port")
            .and_then(|(_, v)| v.trim().parse::<i64>().ok())
            .unwrap_or(80);
        let port = match u16::try_from(port) {
            Ok(p) if p != 0 && self.settings.is_allowed(p) => p,
            _ => return (400, "error"),
        };
        if port_probe::probe(ip, port, self.settings.timeout).await.reachable {
            (200, "yes")
        } else {
            (200, "no")
        }
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy",
            uptime_seconds: self.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
            checks_last_hour: self.checks.load(Ordering::Relaxed),
        }
    }
}
