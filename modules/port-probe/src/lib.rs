//! TCP reachability probe and validation of the requested port list.

use reflector_core::{Rejection, Settings};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Most ports a single check may ask for.
pub const MAX_PORTS: usize = 5;

/// Ports probed when the request names none.
pub const DEFAULT_PORTS: [u16; 2] = [80, 443];

/// Why a port has no reachability verdict. Deliberately coarse: the caller
/// learns nothing about whether a firewall dropped or refused the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortError {
    ConnectionFailed,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
    pub reachable: bool,
    pub latency: Option<Duration>,
    pub error: Option<PortError>,
}

/// Parse the `ports` query value (e.g. "22,80,443") against the allow-list.
///
/// An empty value selects [`DEFAULT_PORTS`]. Order is preserved. Any malformed,
/// out-of-range, duplicated or disallowed entry rejects the whole list.
pub fn parse_requested_ports(spec: &str, settings: &Settings) -> Result<Vec<u16>, Rejection> {
    if spec.trim().is_empty() {
        return Ok(DEFAULT_PORTS.to_vec());
    }
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim) {
        let n: i64 = part
            .parse()
            .map_err(|_| Rejection::InvalidPorts(format!("invalid port: {}", part)))?;
        if !(1..=65535).contains(&n) {
            return Err(Rejection::InvalidPorts(format!("port out of range: {}", n)));
        }
        let p = n as u16;
        if !settings.is_allowed(p) {
            return Err(Rejection::InvalidPorts(format!("port not allowed: {}", p)));
        }
        if ports.contains(&p) {
            return Err(Rejection::InvalidPorts(format!("duplicate port: {}", p)));
        }
        ports.push(p);
    }
    if ports.len() > MAX_PORTS {
        return Err(Rejection::InvalidPorts(format!("too many ports (max {})", MAX_PORTS)));
    }
    Ok(ports)
}

/// One TCP connect attempt bounded by `limit`. The connection is closed as soon
/// as the handshake completes; latency is measured from the start of the dial.
pub async fn probe(ip: IpAddr, port: u16, limit: Duration) -> Reachability {
    let addr = SocketAddr::new(ip, port);
    let start = Instant::now();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let latency = start.elapsed();
            drop(stream);
            Reachability { reachable: true, latency: Some(latency), error: None }
        }
        _ => Reachability { reachable: false, latency: None, error: Some(PortError::ConnectionFailed) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn tag(r: Result<Vec<u16>, Rejection>) -> String {
        match r {
            Err(e) => {
                assert_eq!(e.tag(), "invalid_ports");
                e.to_string()
            }
            Ok(v) => panic!("expected rejection, got {:?}", v),
        }
    }

    #[test]
    fn empty_selects_defaults() {
        let s = Settings::default();
        assert_eq!(parse_requested_ports("", &s).unwrap(), vec![80, 443]);
    }

    #[test]
    fn keeps_request_order() {
        let s = Settings::default();
        assert_eq!(parse_requested_ports("8443, 22,80", &s).unwrap(), vec![8443, 22, 80]);
    }

    #[test]
    fn rejects_bad_lists() {
        let s = Settings::default();
        assert_eq!(tag(parse_requested_ports("80,abc", &s)), "invalid port: abc");
        assert_eq!(tag(parse_requested_ports("0", &s)), "port out of range: 0");
        assert_eq!(tag(parse_requested_ports("70000", &s)), "port out of range: 70000");
        assert_eq!(tag(parse_requested_ports("21", &s)), "port not allowed: 21");
        assert_eq!(tag(parse_requested_ports("80,443,80", &s)), "duplicate port: 80");
        assert_eq!(tag(parse_requested_ports("80,", &s)), "invalid port: ");
    }

    #[test]
    fn rejects_more_than_five() {
        let mut s = Settings::default();
        s.allowed_ports.extend([21, 25]);
        tag(parse_requested_ports("21,22,25,80,443,8080", &s));
        assert_eq!(parse_requested_ports("21,22,25,80,443", &s).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let r = probe("127.0.0.1".parse().unwrap(), port, Duration::from_secs(2)).await;
        assert!(r.reachable);
        assert!(r.latency.is_some());
        assert_eq!(r.error, None);
    }

    #[tokio::test]
    async fn closed_port_is_generic_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let r = probe("127.0.0.1".parse().unwrap(), port, Duration::from_secs(2)).await;
        assert!(!r.reachable);
        assert_eq!(r.latency, None);
        assert_eq!(r.error, Some(PortError::ConnectionFailed));
    }
}
