use anyhow::{bail, Context, Result};
use reflector_core::addr::parse_nets;
use reflector_core::Settings;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_FILE: &str = "reflector.yaml";

/// Optional YAML overrides; every field falls back to [`Settings::default`].
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_port: Option<u16>,
    pub allowed_ports: Option<Vec<u16>>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_per_min: Option<u32>,
    pub log_dir: Option<PathBuf>,
    pub trusted_proxies: Option<Vec<String>>,
    pub tls_port: Option<u16>,
    pub check_deadline_ms: Option<u64>,
    pub banner_timeout_ms: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
}

impl FileConfig {
    fn apply(self, s: &mut Settings) {
        if let Some(v) = self.listen_port { s.listen_port = v; }
        if let Some(v) = self.allowed_ports { s.allowed_ports = v.into_iter().filter(|p| *p != 0).collect(); }
        if let Some(v) = self.timeout_ms { s.timeout = Duration::from_millis(v); }
        if let Some(v) = self.rate_limit_per_min { s.rate_limit_per_min = v; }
        if let Some(v) = self.log_dir { s.log_dir = v; }
        if let Some(v) = self.trusted_proxies { s.trusted_proxies = parse_nets(&v); }
        if let Some(v) = self.tls_port { s.tls_port = v; }
        if let Some(v) = self.check_deadline_ms { s.check_deadline = Duration::from_millis(v); }
        if let Some(v) = self.banner_timeout_ms { s.banner_timeout = Duration::from_millis(v); }
        if let Some(v) = self.cleanup_interval_secs { s.cleanup_interval = Duration::from_secs(v.max(1)); }
    }
}

/// Read `path`, or `./reflector.yaml` when no path is given and that file exists.
pub fn load_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(cfg))
}

/// Durations like `500ms`, `5s`, `2m`, `1h`; a bare number means seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "" | "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

/// Overlay `REFLECTOR_*` variables. Values that do not parse are ignored.
pub fn apply_env(s: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("REFLECTOR_PORT") {
        match v.trim().parse() {
            Ok(p) => s.listen_port = p,
            Err(_) => warn!(value = %v, "ignoring REFLECTOR_PORT"),
        }
    }
    if let Some(v) = var("REFLECTOR_LOG_DIR") {
        s.log_dir = PathBuf::from(v);
    }
    if let Some(v) = var("REFLECTOR_TIMEOUT") {
        match parse_duration(&v) {
            Some(d) => s.timeout = d,
            None => warn!(value = %v, "ignoring REFLECTOR_TIMEOUT"),
        }
    }
    if let Some(v) = var("REFLECTOR_RATE_LIMIT_PER_MIN") {
        match v.trim().parse() {
            Ok(n) => s.rate_limit_per_min = n,
            Err(_) => warn!(value = %v, "ignoring REFLECTOR_RATE_LIMIT_PER_MIN"),
        }
    }
    if let Some(v) = var("REFLECTOR_ALLOWED_PORTS") {
        s.allowed_ports = v
            .split(',')
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p != 0)
            .collect();
    }
}

/// Defaults, then the YAML file, then the environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    if let Some(cfg) = load_config(path)? {
        cfg.apply(&mut settings);
    }
    apply_env(&mut settings, |k| std::env::var(k).ok());
    if settings.allowed_ports.is_empty() {
        bail!("no allowed ports configured");
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("5d"), None);
    }

    #[test]
    fn env_overrides() {
        let mut s = Settings::default();
        apply_env(
            &mut s,
            env(&[
                ("REFLECTOR_PORT", "9090"),
                ("REFLECTOR_TIMEOUT", "750ms"),
                ("REFLECTOR_RATE_LIMIT_PER_MIN", "3"),
                ("REFLECTOR_ALLOWED_PORTS", "22, 443,x,0"),
                ("REFLECTOR_LOG_DIR", "/tmp/reflector"),
            ]),
        );
        assert_eq!(s.listen_port, 9090);
        assert_eq!(s.timeout, Duration::from_millis(750));
        assert_eq!(s.rate_limit_per_min, 3);
        assert_eq!(s.allowed_ports.iter().copied().collect::<Vec<_>>(), vec![22, 443]);
        assert_eq!(s.log_dir, PathBuf::from("/tmp/reflector"));
    }

    #[test]
    fn bad_env_values_keep_defaults() {
        let mut s = Settings::default();
        apply_env(&mut s, env(&[("REFLECTOR_PORT", "eighty"), ("REFLECTOR_TIMEOUT", "soon")]));
        assert_eq!(s.listen_port, 8080);
        assert_eq!(s.timeout, Duration::from_secs(5));
    }

    #[test]
    fn yaml_file_applies() {
        let cfg: FileConfig = serde_yaml::from_str(
            "allowed_ports: [80, 8443]\ntls_port: 8443\ncheck_deadline_ms: 4000\ntrusted_proxies: [\"100.64.0.0/10\"]\n",
        )
        .unwrap();
        let mut s = Settings::default();
        cfg.apply(&mut s);
        assert!(s.is_allowed(8443) && !s.is_allowed(443));
        assert_eq!(s.tls_port, 8443);
        assert_eq!(s.check_deadline, Duration::from_secs(4));
        assert_eq!(s.trusted_proxies.len(), 1);
    }

    #[test]
    fn unknown_yaml_keys_rejected() {
        assert!(serde_yaml::from_str::<FileConfig>("listen_prot: 1\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_error() {
        assert!(load_config(Some(Path::new("/nonexistent/reflector.yaml"))).is_err());
    }
}
