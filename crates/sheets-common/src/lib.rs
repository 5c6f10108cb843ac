//! Common constants and process plumbing for the Google Sheets API server extension

#![deny(missing_docs)]

pub mod telemetry;

use std::time::Duration;

/// Default data root holding PKI material and the generated kubeconfig
pub const DEFAULT_DATA_ROOT: &str = "data";

/// Default HTTPS port the extension API server binds
pub const DEFAULT_BIND_PORT: u16 = 6443;

/// Default bind address, also placed in the server certificate SANs
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// File name of the kubeconfig written under the data root on every start
pub const KUBECONFIG_FILE_NAME: &str = "grafana.kubeconfig";

/// Private API group served by the subresource handler
pub const PLUGIN_API_GROUP: &str = "googlesheets.ext.grafana.com";

/// Version served within [`PLUGIN_API_GROUP`]
pub const PLUGIN_API_VERSION: &str = "v1";

/// Resync period of the admission shared informer factory
pub const DEFAULT_INFORMER_RESYNC: Duration = Duration::from_secs(10 * 60);

/// Install aws-lc-rs as the process-wide rustls crypto provider.
///
/// Both the serving side (axum-server) and the kube client build rustls
/// configs from the process default, so this must run before either.
/// Calling it more than once is harmless.
pub fn install_crypto_provider() {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::trace!("rustls crypto provider already installed");
    }
}
