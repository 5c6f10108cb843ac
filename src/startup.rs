//! Startup orchestration
//!
//! Provision PKI, assemble and complete the configuration, build the
//! server, persist the loopback kubeconfig, then serve. Every stage runs
//! in order on the caller's task; only serving moves to the background.

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use sheets_apiserver::{
    build_server, write_kubeconfig, CertKey, EmptyDelegate, LoopbackClientConfig,
    PostStartHookContext, PreparedServer, ServerHandle, ServerOptions, SharedInformerHandle,
};
use sheets_pki::{CertUtil, ProvisionedPki};
use tracing::{debug, info};

use crate::error::StartError;
use crate::settings::StartupSettings;

/// Name of the hook that starts the shared informers
pub const START_INFORMERS_HOOK: &str = "start-shared-informers";

/// A server ready to serve, with everything startup produced
pub struct PreparedStartup {
    /// Built server with its listener and TLS material
    pub server: PreparedServer,
    /// Where the loopback kubeconfig was written
    pub kubeconfig_path: PathBuf,
    /// Credentials the server trusts for its own requests
    pub loopback: LoopbackClientConfig,
    /// Certificates and keys under the data root
    pub pki: ProvisionedPki,
    /// Filled with the shared informer factory during config completion
    pub informers: SharedInformerHandle,
}

/// Run every startup stage short of serving
pub async fn prepare(settings: &StartupSettings) -> Result<PreparedStartup, StartError> {
    let pki = CertUtil::new(settings.data_root.clone()).provision(settings.bind_address)?;
    info!(ca = %pki.ca_cert.display(), "PKI provisioned");

    let mut options = ServerOptions::new(settings.policy_overrides());
    options.alternate_dns = settings.alternate_dns.clone();
    options.informer_resync = settings.informer_resync;
    options.recommended.secure_serving.bind_address = settings.bind_address;
    options.recommended.secure_serving.cert_key = Some(CertKey::from(pki.apiserver.clone()));
    options.recommended.authentication.client_cert = Some(pki.authn_client.clone());
    options.recommended.authorization.client_cert = Some(pki.authz_client.clone());
    let informers = options.informers.clone();

    options.complete();
    options.validate()?;
    let completed = options.config().await?.complete().await?;

    let server = build_server(completed, &EmptyDelegate).await?;
    let loopback = server.loopback_client_config.clone();
    let server = server.prepare_run()?;

    let kubeconfig_path = settings.kubeconfig_path();
    write_kubeconfig(&loopback, &kubeconfig_path)?;

    Ok(PreparedStartup {
        server,
        kubeconfig_path,
        loopback,
        pki,
        informers,
    })
}

/// Prepare the server and serve it on a background task
///
/// The shared informer factory starts once the listener is bound, so its
/// watches go through the server's own loopback endpoint.
pub async fn start(settings: &StartupSettings) -> Result<ServerHandle, StartError> {
    let PreparedStartup {
        mut server,
        informers,
        ..
    } = prepare(settings).await?;

    server.add_post_start_hook(
        START_INFORMERS_HOOK,
        Arc::new(move |ctx: PostStartHookContext| {
            let informers = informers.clone();
            async move {
                let factory = informers
                    .get()
                    .ok_or_else(|| "shared informer factory was never constructed".to_string())?;
                let started = factory.start(&ctx.cancel);
                debug!(started, "shared informers started");
                Ok::<(), String>(())
            }
            .boxed()
        }),
    )?;

    info!(
        address = %server.server().bind_address(),
        "starting sheets API server"
    );
    Ok(server.run_in_background())
}
