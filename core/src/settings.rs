use ipnet::IpNet;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::addr::parse_nets;

/// Runtime settings injected into the service. Loading them (file, environment)
/// is the binary's job.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_port: u16,
    pub allowed_ports: BTreeSet<u16>,
    /// Per-attempt timeout for reachability, TLS and challenge probes.
    pub timeout: Duration,
    pub rate_limit_per_min: u32,
    pub log_dir: PathBuf,
    pub trusted_proxies: Vec<IpNet>,
    /// The one port that gets TLS analysis.
    pub tls_port: u16,
    /// Wall-clock budget for the whole port loop of a single check.
    pub check_deadline: Duration,
    pub cleanup_interval: Duration,
    pub banner_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            allowed_ports: [22, 80, 443, 8080, 8443].into_iter().collect(),
            timeout: Duration::from_secs(5),
            rate_limit_per_min: 10,
            log_dir: PathBuf::from("/logs"),
            trusted_proxies: parse_nets(&["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]),
            tls_port: 443,
            check_deadline: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(3600),
            banner_timeout: Duration::from_secs(2),
        }
    }
}

impl Settings {
    pub fn is_allowed(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }
}
