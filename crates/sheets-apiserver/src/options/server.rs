//! Options of the Sheets extension server

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use sheets_common::{
    DEFAULT_BIND_PORT, DEFAULT_INFORMER_RESYNC, PLUGIN_API_GROUP, PLUGIN_API_VERSION,
};
use tracing::{debug, warn};

use super::RecommendedOptions;
use crate::admission::{informer_wiring_hook, SharedInformerHandle};
use crate::authn::GROUP_UNAUTHENTICATED;
use crate::authz::AuthorizationPolicy;
use crate::config::RecommendedConfig;
use crate::error::ConfigError;
use crate::openapi::OpenApiConfig;

const OPENAPI_TITLE: &str = "Google Sheets Datasource";

/// Fixed policy applied onto the recommended options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOverrides {
    /// HTTPS port; must not be zero
    pub bind_port: u16,
    /// Used for both authentication and authorization delegation
    pub remote_kubeconfig: Option<PathBuf>,
    /// Paths authorized without a review
    pub always_allow_paths: Vec<String>,
    /// Groups authorized without a review
    pub always_allow_groups: Vec<String>,
    /// Decision for requests the lists above do not cover
    pub authorization_policy: AuthorizationPolicy,
    /// Accept requests without credentials as the anonymous user
    pub anonymous: bool,
    /// Drop etcd options
    pub disable_etcd: bool,
    /// Drop core API options
    pub disable_core_api: bool,
}

impl Default for PolicyOverrides {
    fn default() -> Self {
        Self {
            bind_port: DEFAULT_BIND_PORT,
            remote_kubeconfig: None,
            always_allow_paths: vec!["*".to_string()],
            always_allow_groups: vec![GROUP_UNAUTHENTICATED.to_string()],
            authorization_policy: AuthorizationPolicy::AlwaysAllow,
            anonymous: true,
            disable_etcd: true,
            disable_core_api: true,
        }
    }
}

impl PolicyOverrides {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.bind_port == 0 {
            errors.push("bind port must be between 1 and 65535".to_string());
        }
        if self.authorization_policy == AuthorizationPolicy::Delegated
            && self.remote_kubeconfig.is_none()
        {
            errors.push("delegated authorization requires a remote kubeconfig".to_string());
        }
        if let Some(path) = &self.remote_kubeconfig {
            if !path.is_file() {
                errors.push(format!("remote kubeconfig {} does not exist", path.display()));
            }
        }
        errors
    }
}

/// Options of the Sheets extension server
///
/// Lifecycle: [`complete`](Self::complete), [`validate`](Self::validate),
/// then [`config`](Self::config).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Generic option sets the overrides are applied onto
    pub recommended: RecommendedOptions,
    /// Extra DNS names for the self-signed fallback certificate
    pub alternate_dns: Vec<String>,
    /// Resync period of the shared informer factory
    pub informer_resync: Duration,
    /// Receives the shared informer factory during config completion
    pub informers: SharedInformerHandle,
    /// Fixed policy of this server
    pub overrides: PolicyOverrides,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new(PolicyOverrides::default())
    }
}

impl ServerOptions {
    /// Default option sets carrying `overrides`
    pub fn new(overrides: PolicyOverrides) -> Self {
        Self {
            recommended: RecommendedOptions::default(),
            alternate_dns: Vec::new(),
            informer_resync: DEFAULT_INFORMER_RESYNC,
            informers: SharedInformerHandle::new(),
            overrides,
        }
    }

    /// Normalize user input
    pub fn complete(&mut self) {
        self.alternate_dns.retain(|name| !name.trim().is_empty());
        self.alternate_dns.sort();
        self.alternate_dns.dedup();
    }

    /// Every problem with these options
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.overrides.validate();
        errors.extend(
            self.recommended
                .secure_serving
                .cert_key
                .iter()
                .flat_map(|ck| [&ck.cert_file, &ck.key_file])
                .filter(|file| !file.is_file())
                .map(|file| format!("serving file {} does not exist", file.display())),
        );
        if self.informer_resync.is_zero() {
            errors.push("informer resync period must be positive".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    fn apply_overrides(&mut self) {
        let o = &self.overrides;
        let r = &mut self.recommended;
        r.secure_serving.bind_port = o.bind_port;
        r.authentication.remote_kubeconfig = o.remote_kubeconfig.clone();
        r.authentication.anonymous = o.anonymous;
        r.authorization.remote_kubeconfig = o.remote_kubeconfig.clone();
        r.authorization.always_allow_paths = o.always_allow_paths.clone();
        r.authorization.always_allow_groups = o.always_allow_groups.clone();
        r.authorization.policy = o.authorization_policy;
        if o.disable_etcd {
            r.etcd = None;
        }
        if o.disable_core_api {
            r.core_api = None;
        }
    }

    /// Assemble the server configuration; nothing is started
    pub async fn config(&mut self) -> Result<RecommendedConfig, ConfigError> {
        self.recommended.secure_serving.maybe_default_with_self_signed_certs(
            "localhost",
            &self.alternate_dns,
            &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
        )?;

        self.recommended.admission.initializer_hook = Some(informer_wiring_hook(
            self.informers.clone(),
            self.informer_resync,
        ));

        self.apply_overrides();
        if self.overrides.authorization_policy == AuthorizationPolicy::AlwaysAllow {
            warn!("authorization allows every request; use only for development");
        }

        let mut config = RecommendedConfig::new();
        let openapi = OpenApiConfig::for_group(OPENAPI_TITLE, PLUGIN_API_GROUP, PLUGIN_API_VERSION);
        config.openapi_config = Some(openapi.clone());
        config.openapi_v3_config = Some(openapi);
        config.skip_openapi_installation = false;
        // None until core API options supply the factory and client
        config.shared_informer_factory = None;
        config.client_config = None;

        self.recommended.apply_to(&mut config).await?;
        debug!(policy = ?config.policy, "server configuration assembled");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EtcdOptions;

    #[test]
    fn default_overrides_are_the_development_posture() {
        let overrides = PolicyOverrides::default();
        assert_eq!(overrides.bind_port, 6443);
        assert_eq!(overrides.always_allow_paths, vec!["*".to_string()]);
        assert_eq!(
            overrides.always_allow_groups,
            vec!["system:unauthenticated".to_string()]
        );
        assert!(overrides.disable_etcd && overrides.disable_core_api);
    }

    #[test]
    fn complete_normalizes_alternate_dns() {
        let mut options = ServerOptions::default();
        options.alternate_dns = vec![
            "sheets.local".to_string(),
            " ".to_string(),
            "sheets.local".to_string(),
        ];
        options.complete();
        assert_eq!(options.alternate_dns, vec!["sheets.local".to_string()]);
    }

    #[test]
    fn delegated_policy_without_kubeconfig_fails_validation() {
        let options = ServerOptions::new(PolicyOverrides {
            authorization_policy: AuthorizationPolicy::Delegated,
            bind_port: 0,
            ..Default::default()
        });
        match options.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected invalid options, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn config_applies_overrides_and_disables_storage() {
        let mut options = ServerOptions::default();
        options.recommended.etcd = Some(EtcdOptions {
            servers: vec!["https://127.0.0.1:2379".to_string()],
        });
        options.validate().unwrap();

        let config = options.config().await.unwrap();
        assert_eq!(config.policy.bind_port, 6443);
        assert!(!config.policy.etcd_enabled);
        assert!(!config.policy.core_api_enabled);
        assert!(config.admission_initializer_hook.is_some());
        assert!(config.openapi_config.is_some());
        assert!(!config.skip_openapi_installation);
        assert!(config.shared_informer_factory.is_none());
        assert!(config.client_config.is_none());
        assert!(options.recommended.secure_serving.uses_generated_cert());
    }

    /// Story: the same inputs always produce the same policy
    ///
    /// Two option sets built independently must complete into
    /// configurations whose policy fields match exactly.
    #[tokio::test]
    async fn independent_configs_have_identical_policy() {
        let mut first = ServerOptions::default();
        let mut second = ServerOptions::default();

        let a = first.config().await.unwrap();
        let b = second.config().await.unwrap();
        assert_eq!(a.policy, b.policy);
    }
}
