//! Server configuration and its completion
//!
//! [`RecommendedConfig`] is filled by the options. Completion mints the
//! loopback credentials, runs the admission initializer hook with them and
//! yields the immutable [`CompletedConfig`] a server is built from.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::admission::{AdmissionInitializerHook, AdmissionPlugin, PluginInitializer};
use crate::authn::{Authenticator, LoopbackTokenAuthenticator, UnionAuthenticator};
use crate::authz::{AuthorizationPolicy, Authorizer, PrivilegedGroupsAuthorizer};
use crate::error::ConfigError;
use crate::filters::DEFAULT_MAX_REQUEST_BODY_BYTES;
use crate::informers::SharedInformerFactory;
use crate::loopback::{
    generate_token, loopback_host, LoopbackClientConfig, DEFAULT_LOOPBACK_TIMEOUT,
};
use crate::openapi::OpenApiConfig;
use crate::options::SecureServingInfo;

/// Policy decisions recorded when options are applied
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicySnapshot {
    /// Port the secure listener binds
    pub bind_port: u16,
    /// Paths authorized without a review
    pub always_allow_paths: Vec<String>,
    /// Groups authorized without a review
    pub always_allow_groups: Vec<String>,
    /// Decision for everything else
    pub authorization_policy: AuthorizationPolicy,
    /// Anonymous requests are accepted
    pub anonymous: bool,
    /// etcd-backed storage is configured
    pub etcd_enabled: bool,
    /// Core API access is configured
    pub core_api_enabled: bool,
}

/// Configuration of a generic server before completion
pub struct RecommendedConfig {
    /// Listener address and serving material; required to complete
    pub secure_serving: Option<SecureServingInfo>,
    /// Authenticator for external requests
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Authorizer for external requests
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// OpenAPI v2 document inputs
    pub openapi_config: Option<OpenApiConfig>,
    /// OpenAPI v3 document inputs
    pub openapi_v3_config: Option<OpenApiConfig>,
    /// Leave the OpenAPI endpoints unregistered
    pub skip_openapi_installation: bool,
    /// Informers over the core API, when configured
    pub shared_informer_factory: Option<Arc<SharedInformerFactory>>,
    /// Client configuration for the core API, when configured
    pub client_config: Option<kube::Config>,
    /// Largest accepted request body
    pub max_request_body_bytes: u64,
    /// Timeout of the loopback client
    pub loopback_timeout: Duration,
    /// Produces admission plugin initializers once the loopback exists
    pub admission_initializer_hook: Option<AdmissionInitializerHook>,
    /// Plugins the initializers are applied to
    pub admission_plugins: Vec<Arc<dyn AdmissionPlugin>>,
    /// Policy recorded while options were applied
    pub policy: PolicySnapshot,
}

impl Default for RecommendedConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RecommendedConfig {
    /// Defaults with nothing configured
    pub fn new() -> Self {
        Self {
            secure_serving: None,
            authenticator: None,
            authorizer: None,
            openapi_config: None,
            openapi_v3_config: None,
            skip_openapi_installation: true,
            shared_informer_factory: None,
            client_config: None,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            loopback_timeout: DEFAULT_LOOPBACK_TIMEOUT,
            admission_initializer_hook: None,
            admission_plugins: Vec::new(),
            policy: PolicySnapshot::default(),
        }
    }

    /// Mint loopback credentials and run admission initialization
    pub async fn complete(self) -> Result<CompletedConfig, ConfigError> {
        let secure_serving = self.secure_serving.ok_or_else(|| {
            ConfigError::Invalid(vec!["secure serving is not configured".to_string()])
        })?;

        let token = generate_token()?;
        let loopback = LoopbackClientConfig::new(
            loopback_host(secure_serving.bind_address),
            token.clone(),
            self.loopback_timeout,
        );

        let mut authenticators: Vec<Arc<dyn Authenticator>> =
            vec![Arc::new(LoopbackTokenAuthenticator::new(token))];
        authenticators.extend(self.authenticator);
        let authenticator: Arc<dyn Authenticator> =
            Arc::new(UnionAuthenticator::new(authenticators));

        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(PrivilegedGroupsAuthorizer::new(&[])));

        let mut admission_initializers: Vec<Arc<dyn PluginInitializer>> = Vec::new();
        if let Some(hook) = &self.admission_initializer_hook {
            admission_initializers = hook(loopback.clone()).await?;
        }
        for plugin in &self.admission_plugins {
            for initializer in &admission_initializers {
                initializer.initialize(plugin.as_ref());
            }
        }
        debug!(
            initializers = admission_initializers.len(),
            plugins = self.admission_plugins.len(),
            "admission initialized"
        );
        info!(host = %loopback.host, "configuration completed");

        Ok(CompletedConfig {
            secure_serving,
            authenticator,
            authorizer,
            loopback,
            openapi_config: self.openapi_config,
            openapi_v3_config: self.openapi_v3_config,
            skip_openapi_installation: self.skip_openapi_installation,
            shared_informer_factory: self.shared_informer_factory,
            client_config: self.client_config,
            max_request_body_bytes: self.max_request_body_bytes,
            admission_plugins: self.admission_plugins,
            policy: self.policy,
        })
    }
}

/// Configuration a server is built from
pub struct CompletedConfig {
    /// Listener address and serving material
    pub secure_serving: SecureServingInfo,
    /// Loopback token first, then the configured authenticator
    pub authenticator: Arc<dyn Authenticator>,
    /// Loopback privilege first, then the configured authorizer
    pub authorizer: Arc<dyn Authorizer>,
    /// The server's own client configuration
    pub loopback: LoopbackClientConfig,
    /// OpenAPI v2 document inputs
    pub openapi_config: Option<OpenApiConfig>,
    /// OpenAPI v3 document inputs
    pub openapi_v3_config: Option<OpenApiConfig>,
    /// Leave the OpenAPI endpoints unregistered
    pub skip_openapi_installation: bool,
    /// Informers over the core API, when configured
    pub shared_informer_factory: Option<Arc<SharedInformerFactory>>,
    /// Client configuration for the core API, when configured
    pub client_config: Option<kube::Config>,
    /// Largest accepted request body
    pub max_request_body_bytes: u64,
    /// Initialized admission plugins
    pub admission_plugins: Vec<Arc<dyn AdmissionPlugin>>,
    /// Policy recorded while options were applied
    pub policy: PolicySnapshot,
}

impl std::fmt::Debug for CompletedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedConfig")
            .field("secure_serving", &self.secure_serving)
            .field("loopback", &self.loopback)
            .field("skip_openapi_installation", &self.skip_openapi_installation)
            .field("max_request_body_bytes", &self.max_request_body_bytes)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
