//! Access-log records and the sinks they are written to.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::addr::anonymize_ip;

/// Current UTC time as RFC 3339 at second precision.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0)
        .unwrap_or(now)
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

/// One line of the access log. The client address is anonymized on
/// construction; there is no way to store the raw address in an entry.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    ts: String,
    ip: String,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<u16, bool>,
    pub duration_ms: u64,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessLogEntry {
    pub fn new(client: Option<IpAddr>, method: &str, path: &str, status: u16, elapsed: Duration) -> Self {
        AccessLogEntry {
            ts: now_rfc3339(),
            ip: client.map(|ip| anonymize_ip(ip).to_string()).unwrap_or_default(),
            method: method.to_string(),
            path: path.to_string(),
            ports: Vec::new(),
            results: BTreeMap::new(),
            duration_ms: elapsed.as_millis() as u64,
            status,
            error: None,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn timestamp(&self) -> &str {
        &self.ts
    }
}

/// Destination for access-log entries. Retention and rotation belong to
/// whatever sits behind the sink.
pub trait AccessSink: Send + Sync {
    fn record(&self, entry: &AccessLogEntry);
}

fn encode_line(entry: &AccessLogEntry) -> Option<Vec<u8>> {
    match serde_json::to_vec(entry) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(e) => {
            warn!(error = %e, "failed to encode access log entry");
            None
        }
    }
}

/// Appends one JSON object per line to `<dir>/access.log`.
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
        let path = dir.join("access.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(JsonLinesSink { file: Mutex::new(file) })
    }
}

impl AccessSink for JsonLinesSink {
    fn record(&self, entry: &AccessLogEntry) {
        let Some(line) = encode_line(entry) else { return };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(&line) {
            warn!(error = %e, "access log write failed");
        }
    }
}

pub struct StdoutSink;

impl AccessSink for StdoutSink {
    fn record(&self, entry: &AccessLogEntry) {
        let Some(line) = encode_line(entry) else { return };
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&line);
    }
}

/// File sink under `dir`, or stdout when the directory is unusable.
pub fn open_access_sink(dir: &Path) -> Arc<dyn AccessSink> {
    match JsonLinesSink::open(dir) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "file access log unavailable, writing to stdout");
            Arc::new(StdoutSink)
        }
    }
}
