//! TLS handshake inspection: negotiated protocol, cipher suite and the posture
//! of the certificate a server presents.
//!
//! The client configuration built here accepts any certificate chain. It exists
//! to look at what a server offers and must never be used where the peer needs
//! to be trusted; see [`inspection_client_config`].

use anyhow::{anyhow, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CipherSuite, ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate, X509Name};

const TLS1_0: u16 = 0x0301;
const TLS1_1: u16 = 0x0302;
const TLS1_2: u16 = 0x0303;
const TLS1_3: u16 = 0x0304;

/// A certificate expiring within this many days is flagged.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsWarning {
    WeakTlsVersion,
    SelfSignedCertificate,
    CertificateExpired,
    CertificateExpiresSoon,
    CertificateNotYetValid,
    MissingSan,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub self_signed: bool,
    pub not_before: String,
    pub not_after: String,
    pub days_until_expiry: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    pub serial: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsInfo {
    pub version: String,
    pub cipher_suite: String,
    pub certificate: CertificateInfo,
    pub chain_length: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<TlsWarning>,
}

/// The certificate fields warnings are derived from.
#[derive(Debug, Clone, Copy)]
pub struct CertificateFacts {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub self_signed: bool,
    /// Any DNS or IP subject alternative name present.
    pub has_san: bool,
}

pub fn version_label(raw: u16) -> &'static str {
    match raw {
        TLS1_0 => "TLS 1.0",
        TLS1_1 => "TLS 1.1",
        TLS1_2 => "TLS 1.2",
        TLS1_3 => "TLS 1.3",
        _ => "Unknown",
    }
}

/// IANA name of a cipher suite, e.g. `TLS_AES_128_GCM_SHA256`.
pub fn cipher_suite_name(suite: CipherSuite) -> String {
    let name = format!("{:?}", suite);
    match name.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => name,
    }
}

/// Whole days until `not_after`, rounded up; negative once expired.
pub fn days_until(not_after: OffsetDateTime, now: OffsetDateTime) -> i64 {
    const DAY: i64 = 86_400;
    let secs = (not_after - now).whole_seconds();
    let days = secs.div_euclid(DAY);
    if secs.rem_euclid(DAY) != 0 { days + 1 } else { days }
}

pub fn tls_warnings(version: u16, cert: &CertificateFacts, now: OffsetDateTime) -> Vec<TlsWarning> {
    let mut warnings = Vec::new();
    if version == TLS1_0 || version == TLS1_1 {
        warnings.push(TlsWarning::WeakTlsVersion);
    }
    if cert.self_signed {
        warnings.push(TlsWarning::SelfSignedCertificate);
    }
    if cert.not_after < now {
        warnings.push(TlsWarning::CertificateExpired);
    } else if cert.not_after < now + time::Duration::days(EXPIRY_WARNING_DAYS) {
        warnings.push(TlsWarning::CertificateExpiresSoon);
    }
    if cert.not_before > now {
        warnings.push(TlsWarning::CertificateNotYetValid);
    }
    if !cert.has_san {
        warnings.push(TlsWarning::MissingSan);
    }
    warnings
}

fn common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string()
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| String::new())
}

/// Parse a DER leaf certificate into its reported metadata and warning inputs.
pub fn inspect_certificate(der: &[u8], now: OffsetDateTime) -> Result<(CertificateInfo, CertificateFacts)> {
    let (_, x509) = X509Certificate::from_der(der).map_err(|e| anyhow!("unparseable certificate: {}", e))?;
    let not_before = x509.validity().not_before.to_datetime();
    let not_after = x509.validity().not_after.to_datetime();

    let mut dns_names = Vec::new();
    let mut has_ip_san = false;
    if let Ok(Some(san)) = x509.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(_) => has_ip_san = true,
                _ => {}
            }
        }
    }

    let self_signed = x509.subject().to_string() == x509.issuer().to_string();
    let facts = CertificateFacts {
        not_before,
        not_after,
        self_signed,
        has_san: !dns_names.is_empty() || has_ip_san,
    };
    let info = CertificateInfo {
        subject: common_name(x509.subject()),
        issuer: common_name(x509.issuer()),
        self_signed,
        not_before: rfc3339(not_before),
        not_after: rfc3339(not_after),
        days_until_expiry: days_until(not_after, now),
        dns_names,
        serial: x509.tbs_certificate.serial.to_str_radix(16),
    };
    Ok((info, facts))
}

/// Certificate verifier that accepts every chain. Handshake signatures are
/// still checked so the session keys belong to the presented certificate.
#[derive(Debug)]
struct InspectOnlyVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for InspectOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client configuration for certificate inspection with chain trust checks
/// switched off. Anything it connects to is unauthenticated.
pub fn inspection_client_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = InspectOnlyVerifier { algorithms: provider.signature_verification_algorithms };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Handshake with `ip:port` within `limit` and describe what was negotiated.
pub async fn analyze(ip: IpAddr, port: u16, limit: Duration) -> Result<TlsInfo> {
    let connector = TlsConnector::from(inspection_client_config()?);
    let server_name = ServerName::IpAddress(ip.into());
    let tls = timeout(limit, async {
        let stream = TcpStream::connect(SocketAddr::new(ip, port)).await?;
        connector.connect(server_name, stream).await
    })
    .await??;

    let conn = tls.get_ref().1;
    let certs = conn.peer_certificates().unwrap_or_default();
    let leaf = certs.first().ok_or_else(|| anyhow!("no certificates received"))?;
    let version = conn.protocol_version().map(u16::from).unwrap_or_default();
    let cipher_suite = conn
        .negotiated_cipher_suite()
        .map(|cs| cipher_suite_name(cs.suite()))
        .unwrap_or_else(|| "Unknown".to_string());

    let now = OffsetDateTime::now_utc();
    let (certificate, facts) = inspect_certificate(leaf.as_ref(), now)?;
    Ok(TlsInfo {
        version: version_label(version).to_string(),
        cipher_suite,
        certificate,
        chain_length: certs.len(),
        warnings: tls_warnings(version, &facts, now),
    })
}
