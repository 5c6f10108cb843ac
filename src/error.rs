//! Startup error taxonomy
//!
//! Each boot stage has its own error type; [`StartError`] says which stage
//! failed so the caller can decide whether to abort the process.

use sheets_apiserver::{BootError, ConfigError, PersistError};
use sheets_pki::PkiError;
use thiserror::Error;

/// Failure of the startup sequence
#[derive(Debug, Error)]
pub enum StartError {
    /// Trust material could not be provisioned
    #[error("PKI provisioning failed: {0}")]
    Pki(#[from] PkiError),

    /// Options could not be assembled or completed
    #[error("server configuration failed: {0}")]
    Config(#[from] ConfigError),

    /// The server could not be constructed
    #[error("server construction failed: {0}")]
    Boot(#[from] BootError),

    /// The loopback kubeconfig could not be written
    #[error("kubeconfig persistence failed: {0}")]
    Persist(#[from] PersistError),
}

impl StartError {
    /// Name of the stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Pki(_) => "pki",
            Self::Config(_) => "config",
            Self::Boot(_) => "boot",
            Self::Persist(_) => "persist",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    // ==========================================================================
    // Story Tests: Which stage stopped the boot
    // ==========================================================================
    //
    // Startup is strictly sequential. When a stage fails, the orchestrator
    // returns the stage's own error wrapped in StartError so the operator
    // sees both where and why.

    /// Story: a data root without a CA stops startup before anything serves
    #[test]
    fn story_missing_ca_is_reported_as_pki_failure() {
        let err: StartError = PkiError::CaNotInitialized("/var/lib/sheets/pki".to_string()).into();

        assert_eq!(err.stage(), "pki");
        assert!(err.to_string().contains("PKI provisioning failed"));
        assert!(err.to_string().contains("/var/lib/sheets/pki"));
    }

    /// Story: every invalid option is listed in one message
    #[test]
    fn story_invalid_options_list_every_problem() {
        let err: StartError = ConfigError::Invalid(vec![
            "bind port must be between 1 and 65535".to_string(),
            "delegated authorization requires a remote kubeconfig".to_string(),
        ])
        .into();

        assert_eq!(err.stage(), "config");
        let msg = err.to_string();
        assert!(msg.contains("bind port"));
        assert!(msg.contains("remote kubeconfig"));
    }

    /// Story: registering the same post-start hook twice is a boot failure
    #[test]
    fn story_duplicate_hook_is_boot_failure() {
        let err: StartError =
            BootError::DuplicatePostStartHook("start-shared-informers".to_string()).into();

        assert_eq!(err.stage(), "boot");
        assert!(err.to_string().contains("start-shared-informers"));
    }

    /// Story: an unwritable kubeconfig path keeps its underlying cause
    #[test]
    fn story_persist_failure_keeps_its_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: StartError = PersistError::Write {
            path: "/readonly/grafana.kubeconfig".into(),
            source: PkiError::Io {
                op: "write",
                path: "/readonly/grafana.kubeconfig".to_string(),
                source: io,
            },
        }
        .into();

        assert_eq!(err.stage(), "persist");
        assert!(err.to_string().contains("grafana.kubeconfig"));
        assert!(err.source().is_some());
    }
}
