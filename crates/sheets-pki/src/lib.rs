//! Local PKI for the Sheets API server
//!
//! A single self-signed CA per data root signs three leaf certificates:
//! the serving certificate and the two client certificates used when
//! delegating authentication and authorization to a remote cluster.

#![deny(missing_docs)]

pub mod ca;
pub mod cert_util;
pub mod error;
pub mod store;
pub mod verify;

pub use ca::{self_signed_server_cert, CertificateAuthority, LeafMaterial, LeafSpec, LeafUsage};
pub use cert_util::{
    CertKeyPaths, CertUtil, LeafRole, ProvisionedPki, AUTHN_CLIENT_USER, AUTHZ_CLIENT_USER,
    DEFAULT_API_SERVER_IP,
};
pub use error::{PkiError, Result};
pub use verify::{key_matches_cert, parse_pem, verify_cert_chain, CertificateInfo};
