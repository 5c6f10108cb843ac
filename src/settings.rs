//! Startup settings
//!
//! Everything the orchestrator needs from the outside world. The binary
//! fills this from flags and environment; embedders construct it directly.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use sheets_apiserver::{AuthorizationPolicy, PolicyOverrides};
use sheets_common::{
    DEFAULT_BIND_PORT, DEFAULT_DATA_ROOT, DEFAULT_INFORMER_RESYNC, KUBECONFIG_FILE_NAME,
};

/// Inputs of [`crate::prepare`] and [`crate::start`]
#[derive(Debug, Clone, PartialEq)]
pub struct StartupSettings {
    /// Holds the PKI directory and the generated kubeconfig
    pub data_root: PathBuf,
    /// Listen address, also placed in the server certificate SANs
    pub bind_address: IpAddr,
    /// HTTPS port
    pub bind_port: u16,
    /// Identity and policy provider for delegated authn/authz
    pub remote_kubeconfig: Option<PathBuf>,
    /// How requests are authorized
    pub authorization_policy: AuthorizationPolicy,
    /// Treat requests without credentials as `system:anonymous`
    pub anonymous_auth: bool,
    /// Extra DNS names for the self-signed fallback certificate
    pub alternate_dns: Vec<String>,
    /// Resync period of the shared informer factory
    pub informer_resync: Duration,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: DEFAULT_BIND_PORT,
            remote_kubeconfig: None,
            authorization_policy: AuthorizationPolicy::default(),
            anonymous_auth: true,
            alternate_dns: Vec::new(),
            informer_resync: DEFAULT_INFORMER_RESYNC,
        }
    }
}

impl StartupSettings {
    /// Where the loopback kubeconfig is written
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.data_root.join(KUBECONFIG_FILE_NAME)
    }

    /// Policy applied on top of the recommended options
    pub fn policy_overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            bind_port: self.bind_port,
            remote_kubeconfig: self.remote_kubeconfig.clone(),
            authorization_policy: self.authorization_policy,
            anonymous: self.anonymous_auth,
            ..PolicyOverrides::default()
        }
    }
}
