//! Generic API server
//!
//! A server is a [`PathRecorderMux`] behind the handler chain, with a
//! delegate whose unprotected handler answers whatever the mux does not.
//! [`GenericApiServer::prepare_run`] installs OpenAPI; the prepared server
//! serves HTTPS until cancelled and runs post-start hooks once bound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::IntoResponse;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use futures::future::BoxFuture;
use k8s_openapi::apimachinery::pkg::version::Info;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authz::Authorizer;
use crate::config::CompletedConfig;
use crate::error::{ApiError, BootError, ServeError};
use crate::filters::build_handler_chain;
use crate::informers::SharedInformerFactory;
use crate::loopback::{loopback_host, LoopbackClientConfig};
use crate::mux::{handler_fn, not_found_handler, HttpHandler, PathRecorderMux};
use crate::openapi::OpenApiConfig;

/// Time in-flight requests get to finish after shutdown is requested
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Something a server can fall back to
pub trait DelegationTarget: Send + Sync {
    /// Handler for requests nothing in front of the delegate claimed
    fn unprotected_handler(&self) -> Option<HttpHandler>;

    /// Paths the delegate serves
    fn listed_paths(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Delegate that serves nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDelegate;

impl DelegationTarget for EmptyDelegate {
    fn unprotected_handler(&self) -> Option<HttpHandler> {
        None
    }
}

/// The delegate's unprotected handler, or a plain not-found handler
pub fn delegate_handler(delegate: &dyn DelegationTarget) -> HttpHandler {
    delegate.unprotected_handler().unwrap_or_else(not_found_handler)
}

/// What a post-start hook receives
#[derive(Debug, Clone)]
pub struct PostStartHookContext {
    /// Loopback config pointing at the bound address
    pub loopback_client_config: LoopbackClientConfig,
    /// Cancelled when the server stops
    pub cancel: CancellationToken,
}

/// Runs once the listener is bound
pub type PostStartHookFn =
    Arc<dyn Fn(PostStartHookContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct PostStartHook {
    name: String,
    hook: PostStartHookFn,
}

/// Handlers of a server
#[derive(Clone)]
pub struct ApiServerHandler {
    /// Mux for paths not served by REST storage
    pub non_go_restful_mux: PathRecorderMux,
    /// The full handler chain
    pub director: HttpHandler,
}

/// Server built from a completed configuration
pub struct GenericApiServer {
    /// Request handling chain and its muxes
    pub handler: ApiServerHandler,
    /// Authorizer shared with delegated handlers
    pub authorizer: Arc<dyn Authorizer>,
    /// The server's own client configuration
    pub loopback_client_config: LoopbackClientConfig,
    /// Largest accepted request body
    pub max_request_body_bytes: u64,
    /// Informers over the core API, when configured
    pub shared_informer_factory: Option<Arc<SharedInformerFactory>>,
    bind_address: SocketAddr,
    tls: RustlsConfig,
    openapi_config: Option<OpenApiConfig>,
    openapi_v3_config: Option<OpenApiConfig>,
    skip_openapi_installation: bool,
    post_start_hooks: Vec<PostStartHook>,
}

impl DelegationTarget for GenericApiServer {
    fn unprotected_handler(&self) -> Option<HttpHandler> {
        Some(self.handler.non_go_restful_mux.clone().into_handler())
    }

    fn listed_paths(&self) -> Vec<String> {
        self.handler.non_go_restful_mux.listed_paths()
    }
}

impl GenericApiServer {
    /// Build a server in front of `delegate`
    pub async fn new(
        name: &str,
        config: CompletedConfig,
        delegate: &dyn DelegationTarget,
    ) -> Result<Self, BootError> {
        let tls = RustlsConfig::from_pem(
            config.secure_serving.cert_pem.clone().into_bytes(),
            config.secure_serving.key_pem.as_bytes().to_vec(),
        )
        .await
        .map_err(|e| BootError::Tls(e.to_string()))?;

        let mux = PathRecorderMux::new(name, delegate_handler(delegate));
        let director = build_handler_chain(
            mux.clone().into_handler(),
            config.authenticator.clone(),
            config.authorizer.clone(),
            config.max_request_body_bytes,
        );

        let server = Self {
            handler: ApiServerHandler {
                non_go_restful_mux: mux,
                director,
            },
            authorizer: config.authorizer,
            loopback_client_config: config.loopback,
            max_request_body_bytes: config.max_request_body_bytes,
            shared_informer_factory: config.shared_informer_factory,
            bind_address: config.secure_serving.bind_address,
            tls,
            openapi_config: config.openapi_config,
            openapi_v3_config: config.openapi_v3_config,
            skip_openapi_installation: config.skip_openapi_installation,
            post_start_hooks: Vec::new(),
        };
        server.install_builtin_routes()?;
        info!(server = name, address = %server.bind_address, "API server constructed");
        Ok(server)
    }

    /// Configured listen address
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    fn install_builtin_routes(&self) -> Result<(), BootError> {
        let mux = &self.handler.non_go_restful_mux;
        for path in ["/healthz", "/livez", "/readyz"] {
            mux.handle(path, get_only(|| async { "ok".into_response() }))?;
        }
        mux.handle(
            "/version",
            get_only(|| async { Json(version_info()).into_response() }),
        )?;

        let index = mux.clone();
        mux.handle(
            "/",
            get_only(move || {
                let paths = index.listed_paths();
                async move { Json(json!({ "paths": paths })).into_response() }
            }),
        )?;
        Ok(())
    }

    /// Register a hook to run once the server is listening
    pub fn add_post_start_hook(
        &mut self,
        name: &str,
        hook: PostStartHookFn,
    ) -> Result<(), BootError> {
        if self.post_start_hooks.iter().any(|h| h.name == name) {
            return Err(BootError::DuplicatePostStartHook(name.to_string()));
        }
        self.post_start_hooks.push(PostStartHook {
            name: name.to_string(),
            hook,
        });
        Ok(())
    }

    /// Names of the registered post-start hooks
    pub fn post_start_hook_names(&self) -> Vec<String> {
        self.post_start_hooks.iter().map(|h| h.name.clone()).collect()
    }

    /// Install OpenAPI endpoints and freeze the server for running
    pub fn prepare_run(self) -> Result<PreparedServer, BootError> {
        if !self.skip_openapi_installation {
            self.install_openapi()?;
        }
        Ok(PreparedServer { server: self })
    }

    fn install_openapi(&self) -> Result<(), BootError> {
        let mux = &self.handler.non_go_restful_mux;
        if let Some(config) = &self.openapi_config {
            let document = Arc::new(config.v2_document());
            mux.handle("/openapi/v2", json_document(document))?;
        }
        if let Some(config) = &self.openapi_v3_config {
            mux.handle("/openapi/v3", json_document(Arc::new(config.v3_discovery())))?;
            let document = Arc::new(config.v3_document());
            for group_version in &config.group_versions {
                mux.handle(
                    &format!("/openapi/v3/apis/{}", group_version),
                    json_document(document.clone()),
                )?;
            }
        }
        Ok(())
    }
}

fn get_only<F, Fut>(f: F) -> HttpHandler
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = axum::response::Response> + Send + 'static,
{
    handler_fn(move |req: Request<Body>| {
        let allowed = req.method() == Method::GET || req.method() == Method::HEAD;
        let path = req.uri().path().to_string();
        let f = f.clone();
        async move {
            if !allowed {
                return ApiError::MethodNotAllowed(path).into_response();
            }
            f().await
        }
    })
}

fn json_document(document: Arc<serde_json::Value>) -> HttpHandler {
    get_only(move || {
        let document = document.clone();
        async move { Json(document.as_ref().clone()).into_response() }
    })
}

fn version_info() -> Info {
    let version = env!("CARGO_PKG_VERSION");
    let mut parts = version.split('.');
    Info {
        major: parts.next().unwrap_or_default().to_string(),
        minor: parts.next().unwrap_or_default().to_string(),
        git_version: format!("v{}", version),
        platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        compiler: "rustc".to_string(),
        ..Default::default()
    }
}

/// Server ready to serve
pub struct PreparedServer {
    server: GenericApiServer,
}

impl PreparedServer {
    /// The underlying server
    pub fn server(&self) -> &GenericApiServer {
        &self.server
    }

    /// Register a hook to run once the server is listening
    pub fn add_post_start_hook(
        &mut self,
        name: &str,
        hook: PostStartHookFn,
    ) -> Result<(), BootError> {
        self.server.add_post_start_hook(name, hook)
    }

    /// Serve until `cancel` fires
    ///
    /// Post-start hooks run in registration order once the listener is bound;
    /// a failing hook stops the server. `cancel` is cancelled when serving
    /// ends for any reason.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServeError> {
        let result = self.serve(cancel.clone()).await;
        cancel.cancel();
        result
    }

    async fn serve(self, cancel: CancellationToken) -> Result<(), ServeError> {
        let server = self.server;
        let handle = axum_server::Handle::new();
        let app = Router::new().fallback_service(server.handler.director.clone());

        let mut serve = tokio::spawn(
            axum_server::bind_rustls(server.bind_address, server.tls.clone())
                .handle(handle.clone())
                .serve(app.into_make_service()),
        );

        let Some(bound) = handle.listening().await else {
            // The serve task ended before binding
            return match serve.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ServeError::Io(e)),
                Err(e) => Err(ServeError::Join(e.to_string())),
            };
        };
        info!(address = %bound, "serving securely");

        let mut loopback = server.loopback_client_config.clone();
        loopback.host = loopback_host(bound);
        for hook in &server.post_start_hooks {
            let context = PostStartHookContext {
                loopback_client_config: loopback.clone(),
                cancel: cancel.clone(),
            };
            if let Err(message) = (hook.hook)(context).await {
                error!(hook = %hook.name, error = %message, "post-start hook failed");
                handle.shutdown();
                let _ = serve.await;
                return Err(ServeError::PostStartHook {
                    name: hook.name.clone(),
                    message,
                });
            }
            info!(hook = %hook.name, "post-start hook completed");
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutting down");
                handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
                serve.await
            }
            result = &mut serve => result,
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServeError::Io(e)),
            Err(e) => Err(ServeError::Join(e.to_string())),
        }
    }

    /// Serve on a background task
    ///
    /// Dropping the returned handle leaves the server running; terminal
    /// errors are logged either way.
    pub fn run_in_background(self) -> ServerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = self.run(token).await;
            if let Err(e) = &result {
                error!(error = %e, "API server stopped with error");
            }
            result
        });
        ServerHandle { cancel, task }
    }
}

/// Control over a server running in the background
#[derive(Debug)]
pub struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ServeError>>,
}

impl ServerHandle {
    /// Request graceful shutdown
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the server when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the serve task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the server to stop and return its terminal result
    pub async fn wait(self) -> Result<(), ServeError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "API server task did not complete");
                Err(ServeError::Join(e.to_string()))
            }
        }
    }
}
