//! Certificate inspection and chain verification

use std::net::IpAddr;

use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn now_unix() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Subject, validity and SANs of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// Whether the basic constraints mark this as a CA
    pub is_ca: bool,
    /// IP address SANs
    pub ip_addresses: Vec<IpAddr>,
    /// DNS name SANs
    pub dns_names: Vec<String>,
    /// Raw subject public key bytes
    pub public_key: Vec<u8>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut ip_addresses = Vec::new();
        let mut dns_names = Vec::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("invalid SAN extension: {}", e)))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    _ => {}
                }
            }
        }

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organizations,
            is_ca: cert.is_ca(),
            ip_addresses,
            dns_names,
            public_key: cert.public_key().subject_public_key.data.to_vec(),
        })
    }

    /// Check if the certificate has expired
    pub fn is_expired(&self) -> bool {
        now_unix() >= self.not_after
    }

    /// Whether a TLS client connecting to `host` would accept this certificate
    ///
    /// IP hosts must appear as IP SANs; names must appear as DNS SANs
    /// (case-insensitive, single-label `*.` wildcards honoured).
    pub fn is_valid_for_host(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ip_addresses.contains(&ip);
        }
        let host = host.to_ascii_lowercase();
        self.dns_names.iter().any(|name| {
            let name = name.to_ascii_lowercase();
            match name.strip_prefix("*.") {
                Some(suffix) => host
                    .split_once('.')
                    .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
                None => name == host,
            }
        })
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Outcome of verifying a certificate against a CA
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Whether the certificate chains to the CA and is currently valid
    pub valid: bool,
    /// Reason if invalid
    pub reason: Option<String>,
}

impl VerificationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Verify that `cert_pem` was issued by the CA in `ca_cert_pem`
///
/// Checks the issuer name, the signature and the validity window. Material
/// that cannot be parsed is an error; a certificate that parses but fails a
/// check is reported through [`VerificationResult`].
pub fn verify_cert_chain(cert_pem: &str, ca_cert_pem: &str) -> Result<VerificationResult> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if cert.issuer().as_raw() != ca_cert.subject().as_raw() {
        return Ok(VerificationResult::invalid("issuer does not match CA subject"));
    }

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(VerificationResult::invalid("signature verification failed"));
    }

    let now = now_unix();
    if now < cert.validity().not_before.timestamp() {
        return Ok(VerificationResult::invalid("certificate not yet valid"));
    }
    if now > cert.validity().not_after.timestamp() {
        return Ok(VerificationResult::invalid("certificate expired"));
    }

    Ok(VerificationResult::ok())
}

/// Whether `key_pem` is the private key of the certificate in `cert_pem`
pub fn key_matches_cert(key_pem: &str, cert_pem: &str) -> Result<bool> {
    let key = rcgen::KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;
    let info = CertificateInfo::from_pem(cert_pem)?;
    Ok(info.public_key == key.public_key_raw())
}
