//! Ownership challenge: fetch a token the caller published on their own server.

use reflector_core::addr::host_port;
use reqwest::{redirect::Policy, Client};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

/// Most body bytes read from the challenge response.
const BODY_BUDGET: usize = 256;

pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeResult {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
}

impl ChallengeResult {
    fn verified(token: &str) -> Self {
        ChallengeResult { verified: true, token: Some(token.to_string()), error: None, expected: None, received: None }
    }

    pub fn failed(token: &str, reason: impl Into<String>, received: Option<String>) -> Self {
        ChallengeResult {
            verified: false,
            token: None,
            error: Some(reason.into()),
            expected: Some(token.to_string()),
            received,
        }
    }
}

/// `http://ip:port/.well-known/reflector/<token>` unless `path` overrides the path.
pub fn challenge_url(ip: IpAddr, port: u16, token: &str, path: Option<&str>) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("http://{}/", host_port(ip, port)))?;
    match path.filter(|p| !p.is_empty()) {
        Some(p) => {
            let (p, query) = match p.split_once('?') {
                Some((p, q)) => (p, Some(q)),
                None => (p, None),
            };
            if p.starts_with('/') {
                url.set_path(p);
            } else {
                url.set_path(&format!("/{}", p));
            }
            url.set_query(query);
        }
        None => {
            if let Ok(mut segs) = url.path_segments_mut() {
                segs.clear().extend([".well-known", "reflector", token]);
            }
        }
    }
    Ok(url)
}

/// Fetch the challenge URL once and compare the trimmed body with `token`.
/// Redirects are not followed; a redirect counts as a non-200 status.
pub async fn verify(ip: IpAddr, port: u16, token: &str, path: Option<&str>, limit: Duration) -> ChallengeResult {
    let Ok(url) = challenge_url(ip, port, token, path) else {
        return ChallengeResult::failed(token, "http_error", None);
    };
    let client = match Client::builder().timeout(limit).redirect(Policy::none()).no_proxy().build() {
        Ok(c) => c,
        Err(_) => return ChallengeResult::failed(token, "http_error", None),
    };
    let mut resp = match client.get(url).send().await {
        Ok(r) => r,
        Err(_) => return ChallengeResult::failed(token, "http_error", None),
    };
    let status = resp.status().as_u16();
    if status != 200 {
        return ChallengeResult::failed(token, format!("http_status_{}", status), None);
    }

    let mut body = Vec::with_capacity(BODY_BUDGET);
    while body.len() < BODY_BUDGET {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(BODY_BUDGET - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(_) => return ChallengeResult::failed(token, "read_error", None),
        }
    }

    if trim_ascii(&body) == token.as_bytes() {
        ChallengeResult::verified(token)
    } else {
        let received = String::from_utf8_lossy(trim_ascii(&body)).into_owned();
        ChallengeResult::failed(token, "token_mismatch", Some(received))
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
