//! Client address resolution, private-range classification and anonymization.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;

const PRIVATE_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

fn private_nets() -> &'static [IpNet] {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETS.get_or_init(|| PRIVATE_RANGES.iter().filter_map(|c| c.parse().ok()).collect())
}

/// Request headers with case-insensitive lookup. First value wins.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// IPv4-mapped IPv6 addresses are treated as the IPv4 address they carry.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

fn parse_literal(s: &str) -> Option<IpAddr> {
    s.trim().parse::<IpAddr>().ok().map(canonical)
}

/// Determine the caller's address.
///
/// `X-Forwarded-For` (first entry that parses) beats `X-Real-IP`, which beats the
/// connection peer. Forwarding headers are only believed when the peer is one of
/// `trusted_proxies`, or when no peer is known at all. The result is the raw
/// address and must go through [`anonymize`] before it is logged.
pub fn resolve_client_address(
    headers: &Headers,
    peer: Option<IpAddr>,
    trusted_proxies: &[IpNet],
) -> Option<IpAddr> {
    let peer = peer.map(canonical);
    let honour_headers = match peer {
        Some(p) => trusted_proxies.iter().any(|net| net.contains(&p)),
        None => true,
    };
    if honour_headers {
        if let Some(xff) = headers.get("x-forwarded-for") {
            if let Some(ip) = xff.split(',').find_map(parse_literal) {
                return Some(ip);
            }
        }
        if let Some(ip) = headers.get("x-real-ip").and_then(parse_literal) {
            return Some(ip);
        }
    }
    peer
}

pub fn is_private(ip: IpAddr) -> bool {
    let ip = canonical(ip);
    private_nets().iter().any(|net| net.contains(&ip))
}

pub fn ip_version(ip: IpAddr) -> u8 {
    match canonical(ip) {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 6,
    }
}

/// Truncate an address for storage: IPv4 keeps a /24, IPv6 keeps a /48.
/// Input that is not an IP literal is returned unchanged.
pub fn anonymize(address: &str) -> String {
    match parse_literal(address) {
        Some(ip) => anonymize_ip(ip).to_string(),
        None => address.to_string(),
    }
}

pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match canonical(ip) {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            octets[6..].fill(0);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// `host:port` with IPv6 literals bracketed, suitable for dialing, URLs and `Host` headers.
pub fn host_port(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}

/// Parse a list of CIDR blocks, skipping entries that do not parse.
pub fn parse_nets<S: AsRef<str>>(cidrs: &[S]) -> Vec<IpNet> {
    cidrs.iter().filter_map(|c| c.as_ref().trim().parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn proxies() -> Vec<IpNet> {
        parse_nets(&["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"])
    }

    #[test]
    fn private_ranges_are_flagged() {
        for s in [
            "10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.1.1", "127.0.0.1",
            "169.254.10.10", "::1", "fc00::1", "fd12:3456::1", "fe80::1", "::ffff:10.0.0.1",
        ] {
            assert!(is_private(ip(s)), "{s} should be private");
        }
        for s in ["8.8.8.8", "172.32.0.1", "100.64.0.1", "2001:db8::1", "2a00:1450::1"] {
            assert!(!is_private(ip(s)), "{s} should be public");
        }
    }

    #[test]
    fn forwarded_for_wins_from_trusted_proxy() {
        let headers: Headers = [("X-Forwarded-For", "garbage, 203.0.113.7, 198.51.100.1"), ("X-Real-IP", "198.51.100.9")]
            .into_iter()
            .collect();
        let got = resolve_client_address(&headers, Some(ip("10.0.0.2")), &proxies());
        assert_eq!(got, Some(ip("203.0.113.7")));
    }

    #[test]
    fn real_ip_used_when_forwarded_for_unusable() {
        let headers: Headers = [("x-forwarded-for", "nope"), ("x-real-ip", " 198.51.100.9 ")].into_iter().collect();
        let got = resolve_client_address(&headers, Some(ip("192.168.0.5")), &proxies());
        assert_eq!(got, Some(ip("198.51.100.9")));
    }

    #[test]
    fn untrusted_peer_cannot_spoof_headers() {
        let headers: Headers = [("X-Forwarded-For", "203.0.113.7")].into_iter().collect();
        let got = resolve_client_address(&headers, Some(ip("198.51.100.20")), &proxies());
        assert_eq!(got, Some(ip("198.51.100.20")));
    }

    #[test]
    fn no_candidates_yields_none() {
        let headers: Headers = [("X-Real-IP", "not-an-ip")].into_iter().collect();
        assert_eq!(resolve_client_address(&headers, None, &proxies()), None);
    }

    #[test]
    fn version_detection() {
        assert_eq!(ip_version(ip("203.0.113.7")), 4);
        assert_eq!(ip_version(ip("2001:db8::1")), 6);
        assert_eq!(ip_version(ip("::ffff:203.0.113.7")), 4);
    }

    #[test]
    fn anonymize_truncates_and_is_idempotent() {
        assert_eq!(anonymize("203.0.113.77"), "203.0.113.0");
        assert_eq!(anonymize("2001:db8:abcd:1234:5678:9abc:def0:1234"), "2001:db8:abcd::");
        assert_eq!(anonymize("not an ip"), "not an ip");
        for s in ["203.0.113.77", "2001:db8:abcd:1234::1", "::1", "garbage"] {
            let once = anonymize(s);
            assert_eq!(anonymize(&once), once);
        }
        if let IpAddr::V6(v6) = anonymize_ip(ip("2a00:1450:4001:81c::200e")) {
            assert!(v6.octets()[6..].iter().all(|b| *b == 0));
        } else {
            panic!("expected v6");
        }
    }

    #[test]
    fn host_port_brackets_v6() {
        assert_eq!(host_port(ip("203.0.113.7"), 80), "203.0.113.7:80");
        assert_eq!(host_port(ip("2001:db8::1"), 443), "[2001:db8::1]:443");
    }
}
