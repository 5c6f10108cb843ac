//! Path multiplexing
//!
//! [`PathRecorderMux`] dispatches on exact paths and path prefixes and hands
//! everything else to a not-found handler, which is how a server falls
//! through to its delegate. Handlers may be registered after the mux has
//! been wired into a running handler chain.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::util::{BoxCloneSyncService, Oneshot, ServiceExt};
use tower::Service;

use crate::error::BootError;

/// Type-erased HTTP handler shared across the handler chain
pub type HttpHandler = BoxCloneSyncService<Request<Body>, Response, Infallible>;

/// Wrap an async function as an [`HttpHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HttpHandler
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    BoxCloneSyncService::new(tower::service_fn(move |req| {
        let fut = f(req);
        async move { Ok::<_, Infallible>(fut.await) }
    }))
}

/// Plain-text `404 page not found`, the terminus of every delegation chain
pub fn not_found_handler() -> HttpHandler {
    handler_fn(|_req| async {
        let mut response = (StatusCode::NOT_FOUND, "404 page not found\n").into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        response
    })
}

struct MuxState {
    exact: BTreeMap<String, HttpHandler>,
    // Longest prefix first
    prefixes: Vec<(String, HttpHandler)>,
    not_found: HttpHandler,
}

/// Exact and prefix path dispatch with a not-found fallback
#[derive(Clone)]
pub struct PathRecorderMux {
    name: Arc<str>,
    state: Arc<RwLock<MuxState>>,
}

impl std::fmt::Debug for PathRecorderMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRecorderMux")
            .field("name", &self.name)
            .field("paths", &self.listed_paths())
            .finish()
    }
}

impl PathRecorderMux {
    /// Create an empty mux that answers everything with `not_found`
    pub fn new(name: &str, not_found: HttpHandler) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(RwLock::new(MuxState {
                exact: BTreeMap::new(),
                prefixes: Vec::new(),
                not_found,
            })),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MuxState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MuxState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Serve `path` exactly with `handler`
    pub fn handle(&self, path: &str, handler: HttpHandler) -> Result<(), BootError> {
        let mut state = self.write();
        if state.exact.contains_key(path) {
            return Err(BootError::DuplicatePath(path.to_string()));
        }
        state.exact.insert(path.to_string(), handler);
        tracing::debug!(mux = %self.name, path, "registered exact path");
        Ok(())
    }

    /// Serve every path under `prefix` with `handler`
    ///
    /// `prefix` must end with `/`; the bare path without the slash is not
    /// covered and needs its own [`handle`](Self::handle) registration.
    pub fn handle_prefix(&self, prefix: &str, handler: HttpHandler) -> Result<(), BootError> {
        if !prefix.ends_with('/') {
            return Err(BootError::DuplicatePath(format!(
                "{} (prefix registrations must end with '/')",
                prefix
            )));
        }
        let mut state = self.write();
        if state.prefixes.iter().any(|(p, _)| p == prefix) {
            return Err(BootError::DuplicatePath(prefix.to_string()));
        }
        state.prefixes.push((prefix.to_string(), handler));
        state.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        tracing::debug!(mux = %self.name, prefix, "registered path prefix");
        Ok(())
    }

    /// Replace the handler for unmatched paths
    pub fn set_not_found_handler(&self, handler: HttpHandler) {
        self.write().not_found = handler;
    }

    /// Every registered path; prefixes are reported with their trailing slash
    pub fn listed_paths(&self) -> Vec<String> {
        let state = self.read();
        let mut paths: BTreeSet<String> = state.exact.keys().cloned().collect();
        paths.extend(state.prefixes.iter().map(|(p, _)| p.clone()));
        paths.into_iter().collect()
    }

    fn lookup(&self, path: &str) -> HttpHandler {
        let state = self.read();
        if let Some(handler) = state.exact.get(path) {
            return handler.clone();
        }
        state
            .prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
            .unwrap_or_else(|| state.not_found.clone())
    }

    /// Type-erase this mux for use inside a handler chain
    pub fn into_handler(self) -> HttpHandler {
        BoxCloneSyncService::new(self)
    }
}

impl Service<Request<Body>> for PathRecorderMux {
    type Response = Response;
    type Error = Infallible;
    type Future = Oneshot<HttpHandler, Request<Body>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        self.lookup(req.uri().path()).oneshot(req)
    }
}
