//! Opportunistic banner grabbing. A missing banner is not an error; callers get
//! an empty string and leave the field out.

use anyhow::Result;
use reflector_core::addr::host_port;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Request/response web ports that only talk after being asked.
pub const WEB_PORTS: [u16; 2] = [80, 8080];

/// Ports whose services greet first (FTP, SSH, SMTP); grabbed even when not requested.
pub const GREETING_PORTS: [u16; 3] = [21, 22, 25];

const READ_BUDGET: usize = 256;
const SSH_MAX: usize = 100;
const BANNER_MAX: usize = 200;

pub fn is_greeting_port(port: u16) -> bool {
    GREETING_PORTS.contains(&port)
}

async fn read_banner(ip: IpAddr, port: u16, limit: Duration) -> Result<Vec<u8>> {
    let mut stream = timeout(limit, TcpStream::connect(SocketAddr::new(ip, port))).await??;
    if WEB_PORTS.contains(&port) {
        let req = format!("HEAD / HTTP/1.0\r\nHost: {}\r\n\r\n", host_port(ip, port));
        timeout(limit, stream.write_all(req.as_bytes())).await??;
    }
    let mut buf = vec![0u8; READ_BUDGET];
    let n = timeout(limit, stream.read(&mut buf)).await??;
    buf.truncate(n);
    Ok(buf)
}

/// First bytes the service at `ip:port` sends, sanitized. Empty on any failure.
pub async fn grab_banner(ip: IpAddr, port: u16, limit: Duration) -> String {
    match read_banner(ip, port, limit).await {
        Ok(raw) if !raw.is_empty() => sanitize_banner(&String::from_utf8_lossy(&raw)),
        _ => String::new(),
    }
}

/// Reduce raw service output to something safe to echo back.
///
/// SSH identification strings keep only their first line, printable ASCII,
/// at most 100 characters. Everything else keeps printable ASCII plus tab/CR/LF,
/// is trimmed, and is cut at 200 characters with a trailing `...`.
pub fn sanitize_banner(raw: &str) -> String {
    if raw.starts_with("SSH-") {
        let first = raw.split('\n').next().unwrap_or_default();
        let cleaned: String = first.chars().filter(|c| (' '..='~').contains(c)).collect();
        let mut out = cleaned.trim().to_string();
        out.truncate(SSH_MAX);
        return out;
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| (' '..='~').contains(c) || matches!(*c, '\t' | '\n' | '\r'))
        .collect();
    let mut out = cleaned.trim().to_string();
    if out.len() > BANNER_MAX {
        out.truncate(BANNER_MAX);
        out.push_str("...");
    }
    out
}
