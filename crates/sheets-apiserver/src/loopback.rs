//! Loopback client configuration
//!
//! The server addresses itself with a random bearer token over its own
//! secure port. The same credentials feed the admission informer factory
//! and the kubeconfig written for external tools.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::kubeconfig::KubeconfigFile;

/// Random bytes in a loopback token
const TOKEN_BYTES: usize = 32;

/// Request timeout of loopback clients
pub const DEFAULT_LOOPBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// How the server reaches itself
#[derive(Clone)]
pub struct LoopbackClientConfig {
    /// `https://<host>:<port>`
    pub host: String,
    bearer_token: Zeroizing<String>,
    /// Request timeout
    pub timeout: Duration,
}

impl fmt::Debug for LoopbackClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackClientConfig")
            .field("host", &self.host)
            .field("bearer_token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LoopbackClientConfig {
    /// Loopback config for `host` authenticated with `token`
    pub fn new(host: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            bearer_token: Zeroizing::new(token.into()),
            timeout,
        }
    }

    /// Bearer token the server accepts as itself
    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }

    /// kube client configuration for this loopback
    ///
    /// TLS verification is skipped; the serving certificate may be the
    /// self-signed fallback.
    pub async fn to_kube_config(&self) -> Result<Config, ConfigError> {
        let yaml = KubeconfigFile::from_loopback(self)
            .to_yaml()
            .map_err(|e| loopback_kubeconfig_error(e.to_string()))?;
        let kubeconfig =
            Kubeconfig::from_yaml(&yaml).map_err(|e| loopback_kubeconfig_error(e.to_string()))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| loopback_kubeconfig_error(e.to_string()))?;
        config.connect_timeout = Some(self.timeout);
        config.read_timeout = Some(self.timeout);
        config.write_timeout = Some(self.timeout);
        Ok(config)
    }

    /// kube client bound to this loopback
    pub async fn to_client(&self) -> Result<Client, ConfigError> {
        let config = self.to_kube_config().await?;
        Client::try_from(config).map_err(|e| ConfigError::Client(e.to_string()))
    }
}

fn loopback_kubeconfig_error(message: String) -> ConfigError {
    ConfigError::Kubeconfig {
        path: "<loopback>".to_string(),
        message,
    }
}

/// Generate a random loopback bearer token
pub fn generate_token() -> Result<String, ConfigError> {
    let mut bytes = Zeroizing::new([0u8; TOKEN_BYTES]);
    aws_lc_rs::rand::fill(&mut bytes[..]).map_err(|_| ConfigError::TokenGeneration)?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes[..]))
}

/// `https://` URL of the secure port as seen from this process
pub fn loopback_host(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        addr.ip()
    };
    format!("https://{}", SocketAddr::new(ip, addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_random_and_url_safe() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn loopback_host_rewrites_unspecified_address() {
        assert_eq!(
            loopback_host("0.0.0.0:6443".parse().unwrap()),
            "https://127.0.0.1:6443"
        );
        assert_eq!(
            loopback_host("10.0.0.5:6443".parse().unwrap()),
            "https://10.0.0.5:6443"
        );
        assert_eq!(loopback_host("[::1]:6443".parse().unwrap()), "https://[::1]:6443");
    }

    #[test]
    fn debug_output_hides_token() {
        let config = LoopbackClientConfig::new(
            "https://127.0.0.1:6443",
            "abc123",
            DEFAULT_LOOPBACK_TIMEOUT,
        );
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("abc123"));
        assert!(rendered.contains("127.0.0.1:6443"));
    }

    #[tokio::test]
    async fn kube_config_points_at_loopback() {
        let config = LoopbackClientConfig::new(
            "https://127.0.0.1:6443",
            "abc123",
            DEFAULT_LOOPBACK_TIMEOUT,
        );
        let kube_config = config.to_kube_config().await.unwrap();

        assert_eq!(kube_config.cluster_url.host(), Some("127.0.0.1"));
        assert_eq!(kube_config.cluster_url.port_u16(), Some(6443));
        assert!(kube_config.accept_invalid_certs);
        assert_eq!(kube_config.read_timeout, Some(DEFAULT_LOOPBACK_TIMEOUT));
        assert_eq!(kube_config.default_namespace, "default");
    }
}
