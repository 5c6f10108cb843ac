//! Private API group handler
//!
//! Owns every path under `/apis/<group>`. Discovery for the group is served
//! directly; resource requests are authorized and handed to the backing
//! storage, or to the delegate when there is none.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use axum::Json;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIResource, APIResourceList, GroupVersionForDiscovery,
};
use tower::ServiceExt;
use tracing::debug;

use crate::authn::UserInfo;
use crate::authz::{forbidden, Authorizer, Decision};
use crate::error::ApiError;
use crate::filters::{limit_body, request_info_of};
use crate::mux::{handler_fn, HttpHandler};
use crate::request::RequestInfo;

/// Backing storage for the group's resources
#[async_trait]
pub trait SubresourceStorage: Send + Sync {
    /// Resources advertised in discovery
    fn resources(&self) -> Vec<APIResource>;

    /// Serve an authorized resource request
    async fn handle(&self, info: RequestInfo, request: Request<Body>) -> Response;
}

/// Handler for `/apis/<group>` and everything below it
#[derive(Clone)]
pub struct SubresourceHandler {
    group: String,
    version: String,
    storage: Option<Arc<dyn SubresourceStorage>>,
    authorizer: Arc<dyn Authorizer>,
    max_request_body_bytes: u64,
    delegate: HttpHandler,
}

impl SubresourceHandler {
    /// Handler owning `/apis/<group>`; requests storage cannot serve go to `delegate`
    pub fn new(
        group: &str,
        version: &str,
        storage: Option<Arc<dyn SubresourceStorage>>,
        authorizer: Arc<dyn Authorizer>,
        max_request_body_bytes: u64,
        delegate: HttpHandler,
    ) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            storage,
            authorizer,
            max_request_body_bytes,
            delegate,
        }
    }

    /// `/apis/<group>`
    pub fn group_path(&self) -> String {
        format!("/apis/{}", self.group)
    }

    fn group_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    fn api_group(&self) -> APIGroup {
        let version = GroupVersionForDiscovery {
            group_version: self.group_version(),
            version: self.version.clone(),
        };
        APIGroup {
            name: self.group.clone(),
            preferred_version: Some(version.clone()),
            server_address_by_client_cidrs: None,
            versions: vec![version],
        }
    }

    fn api_resource_list(&self) -> APIResourceList {
        APIResourceList {
            group_version: self.group_version(),
            resources: self
                .storage
                .as_ref()
                .map(|s| s.resources())
                .unwrap_or_default(),
        }
    }

    async fn delegate(&self, req: Request<Body>) -> Response {
        match self.delegate.clone().oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    async fn serve(&self, req: Request<Body>) -> Response {
        let req = match limit_body(req, self.max_request_body_bytes).await {
            Ok(req) => req,
            Err(e) => return e.into_response(),
        };

        let info = request_info_of(&req);
        if !info.is_resource_request {
            return self.serve_discovery(&info, req).await;
        }

        let user = req
            .extensions()
            .get::<UserInfo>()
            .cloned()
            .unwrap_or_else(UserInfo::anonymous);
        match self.authorizer.authorize(&user, &info).await {
            Ok(Decision::Allow) => {}
            Ok(decision) => return forbidden(&user, &info, &decision).into_response(),
            Err(e) => return e.into_response(),
        }

        match &self.storage {
            Some(storage) if info.api_version == self.version => {
                debug!(
                    resource = %info.resource,
                    subresource = %info.subresource,
                    verb = %info.verb,
                    "serving from storage"
                );
                storage.handle(info, req).await
            }
            _ => self.delegate(req).await,
        }
    }

    async fn serve_discovery(&self, info: &RequestInfo, req: Request<Body>) -> Response {
        let path = info.path.trim_end_matches('/');
        let group_path = self.group_path();
        let version_path = format!("{}/{}", group_path, self.version);

        if path != group_path && path != version_path {
            return self.delegate(req).await;
        }
        if req.method() != Method::GET {
            return ApiError::MethodNotAllowed(format!("{} {}", req.method(), info.path))
                .into_response();
        }
        if path == group_path {
            Json(self.api_group()).into_response()
        } else {
            Json(self.api_resource_list()).into_response()
        }
    }

    /// Type-erase for registration in a mux
    pub fn into_handler(self) -> HttpHandler {
        let this = Arc::new(self);
        handler_fn(move |req: Request<Body>| {
            let this = this.clone();
            async move { this.serve(req).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{AlwaysAllowAuthorizer, AlwaysDenyAuthorizer};
    use crate::mux::not_found_handler;
    use axum::http::{header, StatusCode};
    use std::sync::Mutex;

    const GROUP: &str = "googlesheets.ext.grafana.com";

    #[derive(Default)]
    struct RecordingStorage {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SubresourceStorage for RecordingStorage {
        fn resources(&self) -> Vec<APIResource> {
            vec![APIResource {
                name: "datasources/query".to_string(),
                kind: "QueryDataResponse".to_string(),
                namespaced: true,
                verbs: vec!["get".to_string()],
                ..Default::default()
            }]
        }

        async fn handle(&self, info: RequestInfo, _request: Request<Body>) -> Response {
            self.seen.lock().unwrap().push(info.subresource.clone());
            "from storage".into_response()
        }
    }

    fn handler(
        storage: Option<Arc<dyn SubresourceStorage>>,
        authorizer: Arc<dyn Authorizer>,
    ) -> HttpHandler {
        SubresourceHandler::new(GROUP, "v1", storage, authorizer, 1024, not_found_handler())
            .into_handler()
    }

    async fn call(handler: HttpHandler, req: Request<Body>) -> (StatusCode, String) {
        let response = handler.oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn group_discovery_is_served() {
        let (status, body) = call(
            handler(None, Arc::new(AlwaysAllowAuthorizer)),
            request(Method::GET, "/apis/googlesheets.ext.grafana.com"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let group: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(group["kind"], "APIGroup");
        assert_eq!(group["name"], GROUP);
        assert_eq!(
            group["preferredVersion"]["groupVersion"],
            "googlesheets.ext.grafana.com/v1"
        );
    }

    #[tokio::test]
    async fn version_discovery_lists_storage_resources() {
        let storage: Arc<dyn SubresourceStorage> = Arc::new(RecordingStorage::default());
        let (status, body) = call(
            handler(Some(storage), Arc::new(AlwaysAllowAuthorizer)),
            request(Method::GET, "/apis/googlesheets.ext.grafana.com/v1/"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let list: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(list["kind"], "APIResourceList");
        assert_eq!(list["resources"][0]["name"], "datasources/query");
    }

    #[tokio::test]
    async fn version_discovery_without_storage_is_empty() {
        let (_, body) = call(
            handler(None, Arc::new(AlwaysAllowAuthorizer)),
            request(Method::GET, "/apis/googlesheets.ext.grafana.com/v1"),
        )
        .await;
        let list: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(list["resources"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn discovery_rejects_writes() {
        let (status, _) = call(
            handler(None, Arc::new(AlwaysAllowAuthorizer)),
            request(Method::POST, "/apis/googlesheets.ext.grafana.com"),
        )
        .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn resource_requests_reach_storage_once_authorized() {
        let storage = Arc::new(RecordingStorage::default());
        let backing: Arc<dyn SubresourceStorage> = storage.clone();
        let (status, body) = call(
            handler(Some(backing), Arc::new(AlwaysAllowAuthorizer)),
            request(
                Method::GET,
                "/apis/googlesheets.ext.grafana.com/v1/namespaces/default/datasources/sheet/query",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "from storage");
        assert_eq!(*storage.seen.lock().unwrap(), vec!["query".to_string()]);
    }

    #[tokio::test]
    async fn denied_resource_requests_never_reach_storage() {
        let storage = Arc::new(RecordingStorage::default());
        let backing: Arc<dyn SubresourceStorage> = storage.clone();
        let (status, body) = call(
            handler(Some(backing), Arc::new(AlwaysDenyAuthorizer)),
            request(
                Method::GET,
                "/apis/googlesheets.ext.grafana.com/v1/namespaces/default/datasources/sheet/query",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("Forbidden"));
        assert!(storage.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn without_storage_resource_requests_fall_through_to_delegate() {
        let (status, body) = call(
            handler(None, Arc::new(AlwaysAllowAuthorizer)),
            request(Method::GET, "/apis/googlesheets.ext.grafana.com/widgets/foo"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 page not found\n");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/apis/googlesheets.ext.grafana.com/v1/namespaces/default/datasources/sheet/query")
            .header(header::CONTENT_LENGTH, "2048")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(handler(None, Arc::new(AlwaysAllowAuthorizer)), req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn oversized_streamed_bodies_are_rejected() {
        let chunks = futures::stream::iter(
            (0..4).map(|_| Ok::<_, std::io::Error>(vec![b'x'; 512])),
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("/apis/googlesheets.ext.grafana.com/v1/namespaces/default/datasources/sheet/query")
            .body(Body::from_stream(chunks))
            .unwrap();
        let (status, body) = call(handler(None, Arc::new(AlwaysAllowAuthorizer)), req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.contains("RequestEntityTooLarge"));
    }
}
