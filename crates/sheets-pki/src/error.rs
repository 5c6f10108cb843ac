//! PKI error types

use std::path::Path;

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// No CA key/cert pair exists under the PKI directory
    #[error("CA not initialized in {0}")]
    CaNotInitialized(String),

    /// Only one half of the CA key/cert pair exists
    #[error("incomplete CA material: {present} exists but {missing} does not")]
    IncompleteCa {
        /// File that exists
        present: String,
        /// File that is missing
        missing: String,
    },

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Filesystem error on a PKI path
    #[error("failed to {op} {path}: {source}")]
    Io {
        /// Operation that failed (read, write, rename, ...)
        op: &'static str,
        /// Path the operation targeted
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Existing leaf certificate does not chain to the CA
    #[error("{path} is not signed by the current CA: {reason}")]
    ChainMismatch {
        /// Certificate path
        path: String,
        /// Why verification failed
        reason: String,
    },

    /// Existing server certificate does not cover a required host
    #[error("{path} is not valid for host {host}")]
    SanMismatch {
        /// Certificate path
        path: String,
        /// Host missing from the SANs
        host: String,
    },

    /// Existing private key does not belong to its certificate
    #[error("private key {path} does not match its certificate")]
    KeyMismatch {
        /// Key path
        path: String,
    },
}

impl PkiError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
