//! Kubeconfig for the server's own loopback credentials
//!
//! External tools address the running server through a single-cluster,
//! single-context, single-user kubeconfig. TLS verification is disabled in
//! the cluster entry; the bearer token is the only credential.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sheets_pki::store::{self, FileKind};
use tracing::info;

use crate::error::PersistError;
use crate::loopback::LoopbackClientConfig;

/// Name of the only cluster entry
pub const CLUSTER_NAME: &str = "default-cluster";
/// Name of the only context entry
pub const CONTEXT_NAME: &str = "default-context";
/// Name of the only user entry
pub const USER_NAME: &str = "default";
/// Namespace of the only context
pub const DEFAULT_NAMESPACE: &str = "default";

/// Client configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeconfigFile {
    /// Always `v1`
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always `Config`
    pub kind: String,
    /// Named cluster entries
    pub clusters: Vec<NamedCluster>,
    /// Named context entries
    pub contexts: Vec<NamedContext>,
    /// Context used when none is selected
    pub current_context: String,
    /// Named user entries
    pub users: Vec<NamedUser>,
}

/// Cluster entry of a kubeconfig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name referenced by contexts
    pub name: String,
    /// Connection settings
    pub cluster: Cluster,
}

/// How to reach a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    /// Server URL
    pub server: String,
    /// Skip verification of the server certificate
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// Context entry of a kubeconfig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name referenced by `current-context`
    pub name: String,
    /// Cluster and user pairing
    pub context: Context,
}

/// Pairs a cluster with a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Name of a cluster entry
    pub cluster: String,
    /// Name of a user entry
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// User entry of a kubeconfig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name referenced by contexts
    pub name: String,
    /// Credentials
    pub user: User,
}

/// Client credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl KubeconfigFile {
    /// Single-entry kubeconfig for `config`
    pub fn from_loopback(config: &LoopbackClientConfig) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CLUSTER_NAME.to_string(),
                cluster: Cluster {
                    server: config.host.clone(),
                    insecure_skip_tls_verify: true,
                },
            }],
            contexts: vec![NamedContext {
                name: CONTEXT_NAME.to_string(),
                context: Context {
                    cluster: CLUSTER_NAME.to_string(),
                    user: USER_NAME.to_string(),
                    namespace: Some(DEFAULT_NAMESPACE.to_string()),
                },
            }],
            current_context: CONTEXT_NAME.to_string(),
            users: vec![NamedUser {
                name: USER_NAME.to_string(),
                user: User {
                    token: Some(config.bearer_token().to_string()),
                },
            }],
        }
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> Result<String, PersistError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse a kubeconfig file
    pub fn read_from(path: &Path) -> Result<Self, PersistError> {
        let text = std::fs::read_to_string(path).map_err(|source| PersistError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Server URL and bearer token of the current context
    pub fn resolve_current(&self) -> Option<(&str, Option<&str>)> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)?;
        let user = self.users.iter().find(|u| u.name == context.context.user)?;
        Some((cluster.cluster.server.as_str(), user.user.token.as_deref()))
    }
}

/// Write the loopback kubeconfig to `path`, replacing any existing file
pub fn write_kubeconfig(config: &LoopbackClientConfig, path: &Path) -> Result<(), PersistError> {
    let yaml = KubeconfigFile::from_loopback(config).to_yaml()?;
    // Contains a bearer token
    store::write_atomic(path, yaml.as_bytes(), FileKind::PrivateKey).map_err(|source| {
        PersistError::Write {
            path: path.to_path_buf(),
            source,
        }
    })?;
    info!(path = %path.display(), server = %config.host, "wrote loopback kubeconfig");
    Ok(())
}
