//! Server options
//!
//! [`RecommendedOptions`] groups the option sets of a delegated extension
//! server. Each set validates itself and applies onto a
//! [`RecommendedConfig`]. [`ServerOptions`] layers the Sheets policy on top.

mod server;

pub use server::{PolicyOverrides, ServerOptions};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use sheets_pki::{self_signed_server_cert, CertKeyPaths, LeafMaterial};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::admission::{AdmissionInitializerHook, AdmissionPlugin};
use crate::authn::{
    AnonymousAuthenticator, Authenticator, FailOnErrorAuthenticator, TokenReviewAuthenticator,
    UnionAuthenticator,
};
use crate::authz::{
    AlwaysAllowAuthorizer, AlwaysDenyAuthorizer, AuthorizationPolicy, Authorizer, PathAuthorizer,
    PrivilegedGroupsAuthorizer, SubjectAccessReviewAuthorizer, UnionAuthorizer,
};
use crate::config::{PolicySnapshot, RecommendedConfig};
use crate::error::ConfigError;
use crate::informers::SharedInformerFactory;

/// Serving certificate and key files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKey {
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

impl From<CertKeyPaths> for CertKey {
    fn from(paths: CertKeyPaths) -> Self {
        Self {
            cert_file: paths.cert,
            key_file: paths.key,
        }
    }
}

/// Serving material and address after options are applied
#[derive(Clone)]
pub struct SecureServingInfo {
    /// Listener address
    pub bind_address: SocketAddr,
    /// PEM certificate chain presented to clients
    pub cert_pem: String,
    /// PEM private key of the serving certificate
    pub key_pem: Zeroizing<String>,
}

impl fmt::Debug for SecureServingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureServingInfo")
            .field("bind_address", &self.bind_address)
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

/// HTTPS listener options
#[derive(Debug, Clone)]
pub struct SecureServingOptions {
    /// Address to listen on
    pub bind_address: IpAddr,
    /// HTTPS port
    pub bind_port: u16,
    /// Explicit serving certificate
    pub cert_key: Option<CertKey>,
    generated: Option<LeafMaterial>,
}

impl Default for SecureServingOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 443,
            cert_key: None,
            generated: None,
        }
    }
}

impl SecureServingOptions {
    /// Generate a self-signed serving certificate when none is configured
    ///
    /// The certificate covers `public_address`, `alternate_dns` and
    /// `alternate_ips` and is kept in memory.
    pub fn maybe_default_with_self_signed_certs(
        &mut self,
        public_address: &str,
        alternate_dns: &[String],
        alternate_ips: &[IpAddr],
    ) -> Result<(), ConfigError> {
        if self.cert_key.is_some() || self.generated.is_some() {
            return Ok(());
        }
        let material = self_signed_server_cert(public_address, alternate_dns, alternate_ips)?;
        info!(host = public_address, "generated self-signed serving certificate");
        self.generated = Some(material);
        Ok(())
    }

    /// Whether a self-signed certificate was generated
    pub fn uses_generated_cert(&self) -> bool {
        self.cert_key.is_none() && self.generated.is_some()
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.bind_port == 0 {
            errors.push("secure serving bind port must be between 1 and 65535".to_string());
        }
        if let Some(cert_key) = &self.cert_key {
            for file in [&cert_key.cert_file, &cert_key.key_file] {
                if let Err(e) = std::fs::metadata(file) {
                    errors.push(format!("unable to read {}: {}", file.display(), e));
                }
            }
        }
        errors
    }

    fn apply(&self) -> Result<SecureServingInfo, ConfigError> {
        let (cert_pem, key_pem) = match (&self.cert_key, &self.generated) {
            (Some(cert_key), _) => (
                read_file(&cert_key.cert_file)?,
                Zeroizing::new(read_file(&cert_key.key_file)?),
            ),
            (None, Some(material)) => (material.cert_pem.clone(), material.key_pem.clone()),
            (None, None) => {
                return Err(ConfigError::Invalid(vec![
                    "no serving certificate configured".to_string()
                ]))
            }
        };
        Ok(SecureServingInfo {
            bind_address: SocketAddr::new(self.bind_address, self.bind_port),
            cert_pem,
            key_pem,
        })
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Delegated authentication options
#[derive(Debug, Clone)]
pub struct AuthenticationOptions {
    /// Kubeconfig of the cluster that reviews bearer tokens
    pub remote_kubeconfig: Option<PathBuf>,
    /// Identify requests without credentials as the anonymous user
    pub anonymous: bool,
    /// Client certificate presented to the remote cluster
    pub client_cert: Option<CertKeyPaths>,
}

impl Default for AuthenticationOptions {
    fn default() -> Self {
        Self {
            remote_kubeconfig: None,
            anonymous: true,
            client_cert: None,
        }
    }
}

impl AuthenticationOptions {
    fn validate(&self) -> Vec<String> {
        validate_kubeconfig("authentication", self.remote_kubeconfig.as_deref())
    }

    async fn apply(&self) -> Result<Option<Arc<dyn Authenticator>>, ConfigError> {
        let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();
        if let Some(path) = &self.remote_kubeconfig {
            let client = delegated_client(path, self.client_cert.as_ref()).await?;
            authenticators.push(Arc::new(TokenReviewAuthenticator::new(client)));
        }

        let delegated: Arc<dyn Authenticator> = Arc::new(UnionAuthenticator::new(authenticators));
        if self.anonymous {
            return Ok(Some(Arc::new(FailOnErrorAuthenticator::new(
                delegated,
                Arc::new(AnonymousAuthenticator),
            ))));
        }
        Ok(Some(delegated))
    }
}

/// Delegated authorization options
#[derive(Debug, Clone, Default)]
pub struct AuthorizationOptions {
    /// Kubeconfig of the cluster that answers SubjectAccessReviews
    pub remote_kubeconfig: Option<PathBuf>,
    /// Non-resource paths every user may access
    pub always_allow_paths: Vec<String>,
    /// Groups whose members may do anything
    pub always_allow_groups: Vec<String>,
    /// Decision for requests the lists above do not cover
    pub policy: AuthorizationPolicy,
    /// Client certificate presented to the remote cluster
    pub client_cert: Option<CertKeyPaths>,
}

impl AuthorizationOptions {
    fn validate(&self) -> Vec<String> {
        let mut errors = validate_kubeconfig("authorization", self.remote_kubeconfig.as_deref());
        if self.policy == AuthorizationPolicy::Delegated && self.remote_kubeconfig.is_none() {
            errors.push("delegated authorization requires a remote kubeconfig".to_string());
        }
        errors
    }

    async fn apply(&self) -> Result<Arc<dyn Authorizer>, ConfigError> {
        let mut authorizers: Vec<Arc<dyn Authorizer>> = vec![
            Arc::new(PrivilegedGroupsAuthorizer::new(&self.always_allow_groups)),
            Arc::new(PathAuthorizer::new(&self.always_allow_paths)),
        ];
        match self.policy {
            AuthorizationPolicy::AlwaysAllow => authorizers.push(Arc::new(AlwaysAllowAuthorizer)),
            AuthorizationPolicy::AlwaysDeny => authorizers.push(Arc::new(AlwaysDenyAuthorizer)),
            AuthorizationPolicy::Delegated => {
                let path = self.remote_kubeconfig.as_deref().ok_or_else(|| {
                    ConfigError::Invalid(vec![
                        "delegated authorization requires a remote kubeconfig".to_string(),
                    ])
                })?;
                let client = delegated_client(path, self.client_cert.as_ref()).await?;
                authorizers.push(Arc::new(SubjectAccessReviewAuthorizer::new(client)));
            }
        }
        debug!(
            policy = %self.policy,
            paths = ?self.always_allow_paths,
            groups = ?self.always_allow_groups,
            "configured authorization"
        );
        Ok(Arc::new(UnionAuthorizer::new(authorizers)))
    }
}

fn validate_kubeconfig(which: &str, path: Option<&Path>) -> Vec<String> {
    match path {
        Some(path) if !path.is_file() => vec![format!(
            "{} kubeconfig {} does not exist",
            which,
            path.display()
        )],
        _ => Vec::new(),
    }
}

/// Client for a delegated review API
///
/// When `client_cert` is given and both files exist, every user entry of
/// the kubeconfig presents that certificate.
async fn delegated_client(
    path: &Path,
    client_cert: Option<&CertKeyPaths>,
) -> Result<Client, ConfigError> {
    let kubeconfig_error = |message: String| ConfigError::Kubeconfig {
        path: path.display().to_string(),
        message,
    };
    let mut kubeconfig = Kubeconfig::read_from(path).map_err(|e| kubeconfig_error(e.to_string()))?;

    if let Some(cert) = client_cert.filter(|c| c.cert.is_file() && c.key.is_file()) {
        for named in kubeconfig.auth_infos.iter_mut() {
            if let Some(auth) = named.auth_info.as_mut() {
                auth.client_certificate = Some(cert.cert.display().to_string());
                auth.client_key = Some(cert.key.display().to_string());
                auth.client_certificate_data = None;
                auth.client_key_data = None;
            }
        }
        debug!(
            kubeconfig = %path.display(),
            cert = %cert.cert.display(),
            "delegated client presents PKI client certificate"
        );
    }

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| kubeconfig_error(e.to_string()))?;
    Client::try_from(config).map_err(|e| ConfigError::Client(e.to_string()))
}

/// etcd storage options
#[derive(Debug, Clone, Default)]
pub struct EtcdOptions {
    /// etcd endpoints; at least one is required
    pub servers: Vec<String>,
}

impl EtcdOptions {
    fn validate(&self) -> Vec<String> {
        if self.servers.is_empty() {
            vec!["etcd servers must be specified".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Access to the core API of a cluster for shared informers
#[derive(Debug, Clone, Default)]
pub struct CoreApiOptions {
    /// Kubeconfig of the cluster; `None` infers in-cluster or local config
    pub kubeconfig: Option<PathBuf>,
    /// Resync period of the shared informers
    pub resync: std::time::Duration,
}

impl CoreApiOptions {
    fn validate(&self) -> Vec<String> {
        validate_kubeconfig("core API", self.kubeconfig.as_deref())
    }

    async fn apply(&self, config: &mut RecommendedConfig) -> Result<(), ConfigError> {
        let kube_config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| ConfigError::Kubeconfig {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ConfigError::Kubeconfig {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?
            }
            None => Config::infer()
                .await
                .map_err(|e| ConfigError::Client(e.to_string()))?,
        };
        let client =
            Client::try_from(kube_config.clone()).map_err(|e| ConfigError::Client(e.to_string()))?;
        config.client_config = Some(kube_config);
        config.shared_informer_factory = Some(Arc::new(SharedInformerFactory::new(
            client,
            self.resync,
        )));
        Ok(())
    }
}

/// Admission plugins and their initializer hook
#[derive(Clone, Default)]
pub struct AdmissionOptions {
    /// Runs once during config completion
    pub initializer_hook: Option<AdmissionInitializerHook>,
    /// Plugins the initializers are applied to
    pub plugins: Vec<Arc<dyn AdmissionPlugin>>,
}

impl fmt::Debug for AdmissionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionOptions")
            .field("initializer_hook", &self.initializer_hook.is_some())
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Option sets of a delegated extension server
#[derive(Debug, Clone, Default)]
pub struct RecommendedOptions {
    /// HTTPS listener
    pub secure_serving: SecureServingOptions,
    /// Delegated authentication
    pub authentication: AuthenticationOptions,
    /// Delegated authorization
    pub authorization: AuthorizationOptions,
    /// `None` disables etcd-backed storage
    pub etcd: Option<EtcdOptions>,
    /// `None` disables core API access
    pub core_api: Option<CoreApiOptions>,
    /// Admission plugins and their initializer hook
    pub admission: AdmissionOptions,
}

impl RecommendedOptions {
    /// Every validation problem across all option sets
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.secure_serving.validate();
        errors.extend(self.authentication.validate());
        errors.extend(self.authorization.validate());
        if let Some(etcd) = &self.etcd {
            errors.extend(etcd.validate());
        }
        if let Some(core_api) = &self.core_api {
            errors.extend(core_api.validate());
        }
        errors
    }

    /// Policy fields as they will be applied
    pub fn policy_snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            bind_port: self.secure_serving.bind_port,
            always_allow_paths: self.authorization.always_allow_paths.clone(),
            always_allow_groups: self.authorization.always_allow_groups.clone(),
            authorization_policy: self.authorization.policy,
            anonymous: self.authentication.anonymous,
            etcd_enabled: self.etcd.is_some(),
            core_api_enabled: self.core_api.is_some(),
        }
    }

    /// Apply every option set onto `config`
    pub async fn apply_to(&self, config: &mut RecommendedConfig) -> Result<(), ConfigError> {
        if self.etcd.is_some() {
            return Err(ConfigError::Unsupported(
                "etcd-backed storage is not available".to_string(),
            ));
        }

        config.secure_serving = Some(self.secure_serving.apply()?);
        config.authenticator = self.authentication.apply().await?;
        config.authorizer = Some(self.authorization.apply().await?);
        if let Some(core_api) = &self.core_api {
            core_api.apply(config).await?;
        }
        config.admission_initializer_hook = self.admission.initializer_hook.clone();
        config.admission_plugins = self.admission.plugins.clone();
        config.policy = self.policy_snapshot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remote_kubeconfig(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("remote.kubeconfig");
        std::fs::write(
            &path,
            r#"apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: remote
  context:
    cluster: remote
    user: remote
current-context: remote
users:
- name: remote
  user:
    token: remote-token
"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn self_signed_fallback_only_without_explicit_cert() {
        let mut serving = SecureServingOptions::default();
        serving
            .maybe_default_with_self_signed_certs("localhost", &[], &["127.0.0.1".parse().unwrap()])
            .unwrap();
        assert!(serving.uses_generated_cert());
        let info = serving.apply().unwrap();
        assert!(info.cert_pem.contains("BEGIN CERTIFICATE"));

        let mut explicit = SecureServingOptions {
            cert_key: Some(CertKey {
                cert_file: "/nonexistent/tls.crt".into(),
                key_file: "/nonexistent/tls.key".into(),
            }),
            ..Default::default()
        };
        explicit
            .maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        assert!(!explicit.uses_generated_cert());
    }

    #[test]
    fn validation_collects_every_problem() {
        let options = RecommendedOptions {
            secure_serving: SecureServingOptions {
                bind_port: 0,
                cert_key: Some(CertKey {
                    cert_file: "/nonexistent/tls.crt".into(),
                    key_file: "/nonexistent/tls.key".into(),
                }),
                ..Default::default()
            },
            authorization: AuthorizationOptions {
                policy: AuthorizationPolicy::Delegated,
                ..Default::default()
            },
            etcd: Some(EtcdOptions::default()),
            ..Default::default()
        };

        let errors = options.validate();
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("bind port")));
        assert!(errors.iter().any(|e| e.contains("tls.crt")));
        assert!(errors.iter().any(|e| e.contains("remote kubeconfig")));
        assert!(errors.iter().any(|e| e.contains("etcd")));
    }

    #[test]
    fn missing_remote_kubeconfig_is_invalid() {
        let options = AuthenticationOptions {
            remote_kubeconfig: Some("/nonexistent/kubeconfig".into()),
            ..Default::default()
        };
        assert_eq!(options.validate().len(), 1);
    }

    #[tokio::test]
    async fn etcd_storage_is_unsupported() {
        let mut serving = SecureServingOptions {
            bind_port: 6443,
            ..Default::default()
        };
        serving
            .maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        let options = RecommendedOptions {
            secure_serving: serving,
            etcd: Some(EtcdOptions {
                servers: vec!["https://127.0.0.1:2379".to_string()],
            }),
            ..Default::default()
        };

        let mut config = RecommendedConfig::new();
        assert!(matches!(
            options.apply_to(&mut config).await,
            Err(ConfigError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn delegated_options_build_clients_from_remote_kubeconfig() {
        sheets_common::install_crypto_provider();
        let dir = TempDir::new().unwrap();
        let kubeconfig = remote_kubeconfig(&dir);

        let mut serving = SecureServingOptions {
            bind_port: 6443,
            ..Default::default()
        };
        serving
            .maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        let options = RecommendedOptions {
            secure_serving: serving,
            authentication: AuthenticationOptions {
                remote_kubeconfig: Some(kubeconfig.clone()),
                ..Default::default()
            },
            authorization: AuthorizationOptions {
                remote_kubeconfig: Some(kubeconfig),
                always_allow_paths: vec!["*".to_string()],
                policy: AuthorizationPolicy::Delegated,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(options.validate().is_empty());

        let mut config = RecommendedConfig::new();
        options.apply_to(&mut config).await.unwrap();
        assert!(config.authenticator.is_some());
        assert!(config.authorizer.is_some());
        assert_eq!(
            config.policy.authorization_policy,
            AuthorizationPolicy::Delegated
        );
        assert!(!config.policy.etcd_enabled);
        assert!(config.shared_informer_factory.is_none());
    }

    #[tokio::test]
    async fn core_api_options_provide_informer_factory() {
        sheets_common::install_crypto_provider();
        let dir = TempDir::new().unwrap();
        let options = CoreApiOptions {
            kubeconfig: Some(remote_kubeconfig(&dir)),
            resync: std::time::Duration::from_secs(60),
        };

        let mut config = RecommendedConfig::new();
        options.apply(&mut config).await.unwrap();
        let factory = config.shared_informer_factory.unwrap();
        assert_eq!(factory.resync().as_secs(), 60);
        assert!(config.client_config.is_some());
    }
}
