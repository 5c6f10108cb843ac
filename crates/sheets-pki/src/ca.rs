//! Certificate authority and leaf issuance
//!
//! The CA is a self-signed root held as PEM. Leaf certificates are issued
//! with freshly generated keys; the CA never signs foreign key material.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use zeroize::Zeroizing;

use crate::error::{PkiError, Result};
use crate::verify::CertificateInfo;

/// Validity period for the CA certificate (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for leaf certificates (1 year)
pub const LEAF_VALIDITY_YEARS: i64 = 1;

const ORGANIZATION: &str = "Grafana Sheets Extension";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

fn distinguished_name(common_name: &str, organizations: &[&str]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    for org in organizations {
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(org.to_string()),
        );
    }
    dn
}

fn subject_alt_names(ips: &[IpAddr], dns_names: &[String]) -> Result<Vec<SanType>> {
    let mut sans: Vec<SanType> = ips.iter().copied().map(SanType::IpAddress).collect();
    for name in dns_names {
        let dns = Ia5String::try_from(name.clone()).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })?;
        sans.push(SanType::DnsName(dns));
    }
    Ok(sans)
}

fn generate_key(role: &str) -> Result<KeyPair> {
    KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", role, e))
    })
}

/// A certificate and its private key, both PEM encoded
#[derive(Clone)]
pub struct LeafMaterial {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key (zeroized on drop)
    pub key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for LeafMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"[redacted]")
            .finish()
    }
}

/// Role-specific parameters of a leaf certificate
#[derive(Debug, Clone)]
pub struct LeafSpec {
    /// Subject common name; for client certificates this is the user name
    pub common_name: String,
    /// Subject organizations; for client certificates these are the groups
    pub organizations: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// Extended key usage of the leaf
    pub usage: LeafUsage,
}

/// Extended key usage of a leaf certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafUsage {
    /// TLS server authentication
    Server,
    /// TLS client authentication
    Client,
}

impl LeafSpec {
    /// Server certificate for the given SANs
    pub fn server(common_name: &str, ip_addresses: Vec<IpAddr>, dns_names: Vec<String>) -> Self {
        Self {
            common_name: common_name.to_string(),
            organizations: vec![ORGANIZATION.to_string()],
            ip_addresses,
            dns_names,
            usage: LeafUsage::Server,
        }
    }

    /// Client certificate identifying `user` as a member of `groups`
    pub fn client(user: &str, groups: &[&str]) -> Self {
        Self {
            common_name: user.to_string(),
            organizations: groups.iter().map(|g| g.to_string()).collect(),
            ip_addresses: Vec::new(),
            dns_names: Vec::new(),
            usage: LeafUsage::Client,
        }
    }

    fn params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        let orgs: Vec<&str> = self.organizations.iter().map(String::as_str).collect();
        params.distinguished_name = distinguished_name(&self.common_name, &orgs);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match self.usage {
            LeafUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            LeafUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        let (not_before, not_after) = compute_validity(LEAF_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = subject_alt_names(&self.ip_addresses, &self.dns_names)?;
        Ok(params)
    }
}

/// Self-signed root used to sign every leaf under one data root
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: Zeroizing<String>,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, &[ORGANIZATION]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key("CA")?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from its PEM-encoded certificate and key
    ///
    /// Rejects material that does not parse, a certificate that is not a
    /// CA, or a key that does not belong to the certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let info = CertificateInfo::from_pem(cert_pem)?;
        if !info.is_ca {
            return Err(PkiError::ParseError(
                "CA certificate lacks the CA basic constraint".to_string(),
            ));
        }
        if info.public_key != key.public_key_raw() {
            return Err(PkiError::ParseError(
                "CA key does not match CA certificate".to_string(),
            ));
        }

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// PEM-encoded CA certificate
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// PEM-encoded CA private key
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Validity and subject of the CA certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    /// Issue a leaf certificate with a freshly generated key
    pub fn issue(&self, spec: &LeafSpec) -> Result<LeafMaterial> {
        let params = spec.params()?;
        let leaf_key = generate_key(&spec.common_name)?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                spec.common_name, e
            ))
        })?;

        Ok(LeafMaterial {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(leaf_key.serialize_pem()),
        })
    }
}

/// Generate a self-signed serving certificate
///
/// Used when no certificate was provisioned for the secure-serving options.
/// The certificate covers `host`, every alternate DNS name and every IP.
pub fn self_signed_server_cert(
    host: &str,
    alternate_dns: &[String],
    ips: &[IpAddr],
) -> Result<LeafMaterial> {
    let mut dns_names = vec![host.to_string()];
    dns_names.extend(alternate_dns.iter().cloned());
    let spec = LeafSpec::server(
        &format!("{}@{}", host, ::time::OffsetDateTime::now_utc().unix_timestamp()),
        ips.to_vec(),
        dns_names,
    );
    let params = spec.params()?;
    let key = generate_key("self-signed serving")?;
    let cert = params.self_signed(&key).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to self-sign serving cert: {}", e))
    })?;

    Ok(LeafMaterial {
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(key.serialize_pem()),
    })
}
