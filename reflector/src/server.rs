//! Minimal HTTP/1.1 front for the service: one request per connection.

use anyhow::{bail, Result};
use reflector_core::addr::Headers;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::check::{Inbound, Reflector};

const MAX_HEAD: usize = 8 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_GRACE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub cors: bool,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn json<T: serde::Serialize>(status: u16, value: &T, cors: bool) -> Self {
        match serde_json::to_vec(value) {
            Ok(mut body) => {
                body.push(b'\n');
                HttpResponse { status, content_type: "application/json", cors, body }
            }
            Err(e) => {
                warn!(error = %e, "response encoding failed");
                HttpResponse::text(500, "internal error")
            }
        }
    }

    fn text(status: u16, body: &str) -> Self {
        HttpResponse { status, content_type: "text/plain; charset=utf-8", cors: false, body: body.as_bytes().to_vec() }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len()
        );
        if self.cors {
            head.push_str("Access-Control-Allow-Origin: *\r\n");
            head.push_str("Access-Control-Allow-Methods: GET, OPTIONS\r\n");
            head.push_str("Access-Control-Allow-Headers: Content-Type\r\n");
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        _ => "Internal Server Error",
    }
}

/// Parse a request head (everything before the blank line).
pub fn parse_request_head(head: &str) -> Option<Inbound> {
    let mut lines = head.split("\r\n");
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':')?;
        headers.insert(name.trim(), value.trim());
    }
    Some(Inbound { method, path: path.to_string(), query: query.to_string(), headers, peer: None })
}

pub async fn route(service: &Reflector, req: &Inbound) -> HttpResponse {
    let known = matches!(req.path.as_str(), "/check" | "/simple" | "/health");
    match (req.method.as_str(), req.path.as_str()) {
        ("OPTIONS", "/check") => HttpResponse { status: 200, content_type: "text/plain", cors: true, body: Vec::new() },
        ("GET", "/check") => {
            let out = service.handle_check(req).await;
            HttpResponse::json(out.status, &out.body, true)
        }
        ("GET", "/simple") => {
            let (status, body) = service.handle_simple(req).await;
            HttpResponse::text(status, body)
        }
        ("GET", "/health") => HttpResponse::json(200, &service.health(), false),
        _ if known => HttpResponse::text(405, "method not allowed"),
        _ => HttpResponse::text(404, "not found"),
    }
}

/// Read up to the blank line ending the request head. `None` when the head
/// exceeds [`MAX_HEAD`].
async fn read_head(stream: &mut TcpStream) -> Result<Option<String>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before request head");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            buf.truncate(end);
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
        if buf.len() > MAX_HEAD {
            return Ok(None);
        }
    }
}

async fn handle_connection(service: &Reflector, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let response = match timeout(IO_TIMEOUT, read_head(&mut stream)).await?? {
        Some(head) => match parse_request_head(&head) {
            Some(mut req) => {
                req.peer = Some(peer.ip());
                route(service, &req).await
            }
            None => HttpResponse::text(400, "bad request"),
        },
        None => HttpResponse::text(400, "request head too large"),
    };
    timeout(IO_TIMEOUT, stream.write_all(&response.to_bytes())).await??;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Accept connections until `shutdown` resolves, one task per connection.
/// Connections already accepted get up to [`DRAIN_GRACE`] to finish.
pub async fn run(listener: TcpListener, service: Arc<Reflector>, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let svc = service.clone();
                    conns.spawn(async move {
                        if let Err(e) = handle_connection(&svc, stream, peer).await {
                            debug!(error = %e, "connection dropped");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = &mut shutdown => {
                info!(open = conns.len(), "shutting down");
                break;
            }
        }
    }
    drop(listener);
    let drained = timeout(DRAIN_GRACE, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(aborted = conns.len(), "connections still open after grace period");
        conns.abort_all();
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn serve(service: Arc<Reflector>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "reflector listening");
    run(listener, service, shutdown_signal()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflector_core::accesslog::{AccessLogEntry, AccessSink};
    use reflector_core::Settings;

    struct NullSink;

    impl AccessSink for NullSink {
        fn record(&self, _entry: &AccessLogEntry) {}
    }

    fn service() -> Arc<Reflector> {
        Arc::new(Reflector::new(Settings::default(), Arc::new(NullSink)))
    }

    #[test]
    fn parses_head() {
        let req = parse_request_head("GET /check?ports=80,443 HTTP/1.1\r\nHost: x\r\nX-Real-IP: 203.0.113.4").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/check");
        assert_eq!(req.query, "ports=80,443");
        assert_eq!(req.headers.get("x-real-ip"), Some("203.0.113.4"));
        assert!(parse_request_head("GET /check").is_none());
        assert!(parse_request_head("GET / FTP/1.0").is_none());
        assert!(parse_request_head("GET / HTTP/1.1\r\nbroken header").is_none());
    }

    #[test]
    fn cors_headers_only_when_asked() {
        let r = HttpResponse::json(200, &serde_json::json!({"a": 1}), true);
        let text = String::from_utf8(r.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        let plain = String::from_utf8(HttpResponse::text(404, "not found").to_bytes()).unwrap();
        assert!(!plain.contains("Access-Control"));
    }

    #[tokio::test]
    async fn routes() {
        let svc = service();
        let mut req = parse_request_head("OPTIONS /check HTTP/1.1").unwrap();
        let r = route(&svc, &req).await;
        assert_eq!((r.status, r.cors, r.body.len()), (200, true, 0));

        req.method = "POST".into();
        assert_eq!(route(&svc, &req).await.status, 405);

        let req = parse_request_head("GET /nope HTTP/1.1").unwrap();
        assert_eq!(route(&svc, &req).await.status, 404);
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run(listener, service(), async move {
            let _ = stop_rx.await;
        }));

        let fetch = |path: &'static str| async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).as_bytes()).await.unwrap();
            let mut out = String::new();
            s.read_to_string(&mut out).await.unwrap();
            out
        };

        let health = fetch("/health").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"), "{health}");
        assert!(health.contains("\"status\":\"healthy\""));

        // Loopback callers are private and must be refused.
        let check = fetch("/check?ports=80").await;
        assert!(check.starts_with("HTTP/1.1 403 Forbidden"), "{check}");
        assert!(check.contains("\"error\":\"private_ip\""));
        assert!(check.contains("Access-Control-Allow-Origin: *"));

        let simple = fetch("/simple?port=80").await;
        assert!(simple.starts_with("HTTP/1.1 403"));
        assert!(simple.ends_with("error"));

        let _ = stop_tx.send(());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_request_finishes_after_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run(listener, service(), async move {
            let _ = stop_rx.await;
        }));

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"GET /health HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.is_finished());

        s.write_all(b"Host: test\r\n\r\n").await.unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"), "{out}");
        timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
