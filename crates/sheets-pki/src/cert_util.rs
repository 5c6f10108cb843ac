//! PKI provisioning under a data root
//!
//! Layout, relative to the data root:
//!
//! ```text
//! pki/ca.crt            pki/ca.key
//! pki/apiserver.crt     pki/apiserver.key
//! pki/authn-client.crt  pki/authn-client.key
//! pki/authz-client.crt  pki/authz-client.key
//! ```
//!
//! Every operation is idempotent: existing material is verified and reused,
//! missing material is generated. Nothing is ever rewritten in place; to
//! regenerate a certificate delete its files and start again. Provisioning
//! must run in the order CA, server, authz client, authn client.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::ca::{CertificateAuthority, LeafSpec};
use crate::error::{PkiError, Result};
use crate::store::{read_if_exists, write_atomic, FileKind};
use crate::verify::{key_matches_cert, verify_cert_chain, CertificateInfo};

/// Address the API server binds and certifies by default
pub const DEFAULT_API_SERVER_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Common name of the local CA
pub const CA_COMMON_NAME: &str = "sheets-apiserver-ca";

/// User the authentication delegation client presents
pub const AUTHN_CLIENT_USER: &str = "sheets-apiserver-authn-client";

/// User the authorization delegation client presents
pub const AUTHZ_CLIENT_USER: &str = "sheets-apiserver-authz-client";

const PKI_DIR: &str = "pki";

/// A certificate file and its private key file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPaths {
    /// PEM certificate path
    pub cert: PathBuf,
    /// PEM private key path
    pub key: PathBuf,
}

/// Leaf certificate roles issued by the local CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRole {
    /// Serving certificate of the API server
    ApiServer,
    /// Client certificate for delegated authentication calls
    AuthnClient,
    /// Client certificate for delegated authorization calls
    AuthzClient,
}

impl LeafRole {
    fn file_stem(self) -> &'static str {
        match self {
            LeafRole::ApiServer => "apiserver",
            LeafRole::AuthnClient => "authn-client",
            LeafRole::AuthzClient => "authz-client",
        }
    }
}

impl std::fmt::Display for LeafRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Everything [`CertUtil::provision`] produced
#[derive(Debug, Clone)]
pub struct ProvisionedPki {
    /// CA certificate path
    pub ca_cert: PathBuf,
    /// Serving certificate and key
    pub apiserver: CertKeyPaths,
    /// Authorization delegation client certificate and key
    pub authz_client: CertKeyPaths,
    /// Authentication delegation client certificate and key
    pub authn_client: CertKeyPaths,
}

/// Provisions the CA and leaf certificates under a data root
#[derive(Debug, Clone)]
pub struct CertUtil {
    data_path: PathBuf,
}

impl CertUtil {
    /// Create a provisioner rooted at `data_path`
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    /// Data root this provisioner writes under
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Directory holding all PKI files
    pub fn pki_dir(&self) -> PathBuf {
        self.data_path.join(PKI_DIR)
    }

    /// CA certificate and key paths
    pub fn ca_paths(&self) -> CertKeyPaths {
        self.paths_for("ca")
    }

    /// Paths of the leaf certificate for `role`
    pub fn leaf_paths(&self, role: LeafRole) -> CertKeyPaths {
        self.paths_for(role.file_stem())
    }

    /// Serving certificate path
    pub fn apiserver_cert_file(&self) -> PathBuf {
        self.leaf_paths(LeafRole::ApiServer).cert
    }

    /// Serving key path
    pub fn apiserver_key_file(&self) -> PathBuf {
        self.leaf_paths(LeafRole::ApiServer).key
    }

    fn paths_for(&self, stem: &str) -> CertKeyPaths {
        let dir = self.pki_dir();
        CertKeyPaths {
            cert: dir.join(format!("{}.crt", stem)),
            key: dir.join(format!("{}.key", stem)),
        }
    }

    /// Ensure the CA exists, creating it on first run
    ///
    /// Existing material that does not parse, or a CA with only one of its
    /// two files present, is an error rather than being replaced: replacing
    /// the CA would orphan every leaf issued by it.
    pub fn initialize_ca(&self) -> Result<CertificateAuthority> {
        let paths = self.ca_paths();
        match self.read_ca(&paths)? {
            Some(ca) => {
                debug!(path = %paths.cert.display(), "reusing existing CA");
                Ok(ca)
            }
            None => {
                let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
                persist_ca(&paths, &ca)?;
                info!(path = %paths.cert.display(), "created CA");
                Ok(ca)
            }
        }
    }

    /// Load the CA without creating it
    pub fn load_ca(&self) -> Result<CertificateAuthority> {
        self.read_ca(&self.ca_paths())?
            .ok_or_else(|| PkiError::CaNotInitialized(self.pki_dir().display().to_string()))
    }

    fn read_ca(&self, paths: &CertKeyPaths) -> Result<Option<CertificateAuthority>> {
        let cert = read_if_exists(&paths.cert)?;
        let key = read_if_exists(&paths.key)?;
        match (cert, key) {
            (Some(cert), Some(key)) => CertificateAuthority::from_pem(&cert, &key).map(Some),
            (None, None) => Ok(None),
            (Some(_), None) => Err(PkiError::IncompleteCa {
                present: paths.cert.display().to_string(),
                missing: paths.key.display().to_string(),
            }),
            (None, Some(_)) => Err(PkiError::IncompleteCa {
                present: paths.key.display().to_string(),
                missing: paths.cert.display().to_string(),
            }),
        }
    }

    /// Ensure the serving certificate exists and covers `bind_ip` and loopback
    pub fn ensure_apiserver_pki(&self, bind_ip: IpAddr) -> Result<CertKeyPaths> {
        let mut ips = vec![DEFAULT_API_SERVER_IP];
        if !ips.contains(&bind_ip) {
            ips.push(bind_ip);
        }
        let hosts: Vec<String> = ips
            .iter()
            .map(IpAddr::to_string)
            .chain(std::iter::once("localhost".to_string()))
            .collect();
        let spec = LeafSpec::server("sheets-apiserver", ips, vec!["localhost".to_string()]);
        self.ensure_leaf(LeafRole::ApiServer, &spec, &hosts)
    }

    /// Ensure the authorization delegation client certificate exists
    pub fn ensure_authz_client_pki(&self) -> Result<CertKeyPaths> {
        let spec = LeafSpec::client(AUTHZ_CLIENT_USER, &[]);
        self.ensure_leaf(LeafRole::AuthzClient, &spec, &[])
    }

    /// Ensure the authentication delegation client certificate exists
    pub fn ensure_authn_client_pki(&self) -> Result<CertKeyPaths> {
        let spec = LeafSpec::client(AUTHN_CLIENT_USER, &[]);
        self.ensure_leaf(LeafRole::AuthnClient, &spec, &[])
    }

    /// Run every provisioning step in order, stopping at the first failure
    pub fn provision(&self, bind_ip: IpAddr) -> Result<ProvisionedPki> {
        self.initialize_ca()?;
        let ca_cert = self.ca_paths().cert;
        let apiserver = self.ensure_apiserver_pki(bind_ip)?;
        let authz_client = self.ensure_authz_client_pki()?;
        let authn_client = self.ensure_authn_client_pki()?;
        info!(pki_dir = %self.pki_dir().display(), "PKI provisioned");

        Ok(ProvisionedPki {
            ca_cert,
            apiserver,
            authz_client,
            authn_client,
        })
    }

    fn ensure_leaf(
        &self,
        role: LeafRole,
        spec: &LeafSpec,
        required_hosts: &[String],
    ) -> Result<CertKeyPaths> {
        // Loading the CA first guarantees nothing is written without one
        let ca = self.load_ca()?;
        let paths = self.leaf_paths(role);

        let cert = read_if_exists(&paths.cert)?;
        let key = read_if_exists(&paths.key)?;
        if let (Some(cert), Some(key)) = (&cert, &key) {
            check_existing_leaf(&ca, &paths, cert, key, required_hosts)?;
            debug!(%role, path = %paths.cert.display(), "reusing existing certificate");
            return Ok(paths);
        }
        if cert.is_some() || key.is_some() {
            info!(%role, "certificate or key missing, regenerating pair");
        }

        let material = ca.issue(spec)?;
        write_atomic(&paths.key, material.key_pem.as_bytes(), FileKind::PrivateKey)?;
        write_atomic(&paths.cert, material.cert_pem.as_bytes(), FileKind::Certificate)?;
        info!(%role, path = %paths.cert.display(), "issued certificate");
        Ok(paths)
    }
}

fn check_existing_leaf(
    ca: &CertificateAuthority,
    paths: &CertKeyPaths,
    cert_pem: &str,
    key_pem: &str,
    required_hosts: &[String],
) -> Result<()> {
    let chain = verify_cert_chain(cert_pem, ca.ca_cert_pem())?;
    if !chain.valid {
        return Err(PkiError::ChainMismatch {
            path: paths.cert.display().to_string(),
            reason: chain.reason.unwrap_or_default(),
        });
    }

    if !key_matches_cert(key_pem, cert_pem)? {
        return Err(PkiError::KeyMismatch {
            path: paths.key.display().to_string(),
        });
    }

    let info = CertificateInfo::from_pem(cert_pem)?;
    if let Some(host) = required_hosts.iter().find(|h| !info.is_valid_for_host(h)) {
        return Err(PkiError::SanMismatch {
            path: paths.cert.display().to_string(),
            host: host.clone(),
        });
    }
    Ok(())
}

/// Write both halves of a new CA, or neither
///
/// A key left behind without its certificate would make every later start
/// fail with [`PkiError::IncompleteCa`].
fn persist_ca(paths: &CertKeyPaths, ca: &CertificateAuthority) -> Result<()> {
    write_atomic(&paths.key, ca.ca_key_pem().as_bytes(), FileKind::PrivateKey)?;
    let written = write_atomic(&paths.cert, ca.ca_cert_pem().as_bytes(), FileKind::Certificate);
    if let Err(e) = written {
        if let Err(cleanup) = std::fs::remove_file(&paths.key) {
            warn!(
                path = %paths.key.display(),
                error = %cleanup,
                "failed to remove orphaned CA key"
            );
        }
        return Err(e);
    }
    Ok(())
}
