//! Handler chain filters
//!
//! The protected handler is built as
//! `request info -> max body -> authentication -> authorization -> mux`.
//! Each filter wraps an [`HttpHandler`] and stores what it learned in the
//! request extensions for the layers below.

use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::http::{header, Request};
use axum::response::IntoResponse;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tower::ServiceExt;
use tracing::debug;

use crate::authn::{Authenticator, UserInfo};
use crate::authz::{forbidden, Authorizer, Decision};
use crate::error::ApiError;
use crate::mux::{handler_fn, HttpHandler};
use crate::request::RequestInfo;

/// Default limit on request bodies (3 MiB)
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: u64 = 3 * 1024 * 1024;

async fn forward(inner: HttpHandler, req: Request<Body>) -> axum::response::Response {
    match inner.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Request info stored in the extensions, or computed from the request line
pub fn request_info_of(req: &Request<Body>) -> RequestInfo {
    req.extensions()
        .get::<RequestInfo>()
        .cloned()
        .unwrap_or_else(|| RequestInfo::new(req.method(), req.uri()))
}

/// Declared body length, if any
pub fn content_length(req: &Request<Body>) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Classify the request and store the [`RequestInfo`] in its extensions
pub fn with_request_info(inner: HttpHandler) -> HttpHandler {
    handler_fn(move |mut req: Request<Body>| {
        let inner = inner.clone();
        async move {
            let info = RequestInfo::new(req.method(), req.uri());
            req.extensions_mut().insert(info);
            forward(inner, req).await
        }
    })
}

/// Enforce the body limit on `req`
///
/// A declared `Content-Length` over `limit` is rejected up front. A body of
/// unknown length is buffered up to `limit` bytes and rejected as soon as it
/// grows past it; the buffered bytes replace the original body.
pub async fn limit_body(req: Request<Body>, limit: u64) -> Result<Request<Body>, ApiError> {
    if content_length(&req).is_some_and(|len| len > limit) {
        return Err(ApiError::RequestEntityTooLarge(limit));
    }
    match req.body().size_hint().exact() {
        Some(len) if len <= limit => return Ok(req),
        Some(_) => return Err(ApiError::RequestEntityTooLarge(limit)),
        None => {}
    }

    let (parts, body) = req.into_parts();
    let max = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, max).collect().await {
        Ok(collected) => Ok(Request::from_parts(parts, Body::from(collected.to_bytes()))),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ApiError::RequestEntityTooLarge(limit))
        }
        Err(e) => Err(ApiError::BadRequest(format!("failed to read request body: {e}"))),
    }
}

/// Reject requests whose body is larger than `limit` bytes
pub fn with_max_request_body(inner: HttpHandler, limit: u64) -> HttpHandler {
    handler_fn(move |req: Request<Body>| {
        let inner = inner.clone();
        async move {
            match limit_body(req, limit).await {
                Ok(req) => forward(inner, req).await,
                Err(e) => e.into_response(),
            }
        }
    })
}

/// Identify the caller and store the [`UserInfo`] in the extensions
pub fn with_authentication(
    inner: HttpHandler,
    authenticator: Arc<dyn Authenticator>,
) -> HttpHandler {
    handler_fn(move |req: Request<Body>| {
        let inner = inner.clone();
        let authenticator = authenticator.clone();
        async move {
            let (mut parts, body) = req.into_parts();
            let user = match authenticator.authenticate(&parts).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    return ApiError::Unauthorized("no credentials provided".into()).into_response()
                }
                Err(e) => return e.into_response(),
            };
            // Credentials are not forwarded past authentication
            parts.headers.remove(header::AUTHORIZATION);
            parts.extensions.insert(user);
            forward(inner, Request::from_parts(parts, body)).await
        }
    })
}

/// Forbid requests the authorizer does not allow
pub fn with_authorization(inner: HttpHandler, authorizer: Arc<dyn Authorizer>) -> HttpHandler {
    handler_fn(move |req: Request<Body>| {
        let inner = inner.clone();
        let authorizer = authorizer.clone();
        async move {
            let Some(user) = req.extensions().get::<UserInfo>().cloned() else {
                return ApiError::Internal("no user found for request".into()).into_response();
            };
            let info = request_info_of(&req);
            match authorizer.authorize(&user, &info).await {
                Ok(Decision::Allow) => forward(inner, req).await,
                Ok(decision) => {
                    debug!(
                        user = %user.name,
                        path = %info.path,
                        verb = %info.verb,
                        ?decision,
                        "request forbidden"
                    );
                    forbidden(&user, &info, &decision).into_response()
                }
                Err(e) => e.into_response(),
            }
        }
    })
}

/// Assemble the protected handler chain around `mux`
pub fn build_handler_chain(
    mux: HttpHandler,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    max_request_body_bytes: u64,
) -> HttpHandler {
    let handler = with_authorization(mux, authorizer);
    let handler = with_authentication(handler, authenticator);
    let handler = with_max_request_body(handler, max_request_body_bytes);
    with_request_info(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::{AnonymousAuthenticator, LoopbackTokenAuthenticator, UnionAuthenticator};
    use crate::authz::{AlwaysAllowAuthorizer, AlwaysDenyAuthorizer, MockAuthorizer};
    use axum::http::StatusCode;

    fn echo_user() -> HttpHandler {
        handler_fn(|req: Request<Body>| async move {
            let user = req
                .extensions()
                .get::<UserInfo>()
                .map(|u| u.name.clone())
                .unwrap_or_default();
            let auth_header = req.headers().contains_key(header::AUTHORIZATION);
            format!("{} {}", user, auth_header).into_response()
        })
    }

    async fn call(handler: HttpHandler, req: Request<Body>) -> (StatusCode, String) {
        let response = handler.oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn oversized_declared_body_is_rejected() {
        let handler = with_max_request_body(echo_user(), 10);
        let req = Request::builder()
            .method("POST")
            .uri("/apis/g/v1/things")
            .header(header::CONTENT_LENGTH, "11")
            .body(Body::from("01234567890"))
            .unwrap();

        let (status, body) = call(handler, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.contains("RequestEntityTooLarge"));
    }

    fn drain_body() -> HttpHandler {
        handler_fn(|req: Request<Body>| async move {
            match axum::body::to_bytes(req.into_body(), usize::MAX).await {
                Ok(bytes) => format!("read {} bytes", bytes.len()).into_response(),
                Err(e) => ApiError::Internal(e.to_string()).into_response(),
            }
        })
    }

    fn streamed(chunks: usize, chunk_len: usize) -> Body {
        let chunk = vec![b'x'; chunk_len];
        Body::from_stream(futures::stream::iter(
            (0..chunks).map(move |_| Ok::<_, std::io::Error>(chunk.clone())),
        ))
    }

    /// Story: a chunked upload cannot slip past the body limit
    ///
    /// Without a Content-Length the limit is enforced while reading, so a
    /// 1000-byte stream never reaches the handler behind a 10-byte limit.
    #[tokio::test]
    async fn oversized_streamed_body_is_rejected() {
        let handler = with_max_request_body(drain_body(), 10);
        let req = Request::builder()
            .method("POST")
            .uri("/apis/g/v1/things")
            .body(streamed(10, 100))
            .unwrap();

        let (status, body) = call(handler, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.contains("RequestEntityTooLarge"));
    }

    #[tokio::test]
    async fn streamed_body_within_limit_is_forwarded_intact() {
        let handler = with_max_request_body(drain_body(), 1000);
        let req = Request::builder()
            .method("POST")
            .uri("/apis/g/v1/things")
            .body(streamed(4, 25))
            .unwrap();

        let (status, body) = call(handler, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "read 100 bytes");
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected_without_anonymous() {
        let authn = Arc::new(LoopbackTokenAuthenticator::new("secret"));
        let handler = with_authentication(echo_user(), authn);

        let (status, _) = call(handler, get("/healthz")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authentication_strips_credentials_and_records_user() {
        let authn = Arc::new(LoopbackTokenAuthenticator::new("secret"));
        let handler = with_authentication(echo_user(), authn);
        let req = Request::builder()
            .uri("/healthz")
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();

        let (status, body) = call(handler, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "system:apiserver false");
    }

    #[tokio::test]
    async fn denied_request_gets_forbidden_status() {
        let chain = build_handler_chain(
            echo_user(),
            Arc::new(AnonymousAuthenticator),
            Arc::new(AlwaysDenyAuthorizer),
            DEFAULT_MAX_REQUEST_BODY_BYTES,
        );

        let (status, body) = call(chain, get("/apis/g/v1/things")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("system:anonymous"));
    }

    #[tokio::test]
    async fn authorizer_sees_classified_request() {
        let mut authz = MockAuthorizer::new();
        authz
            .expect_authorize()
            .withf(|user, info| {
                user.name == "system:anonymous"
                    && info.is_resource_request
                    && info.resource == "things"
                    && info.verb == "list"
            })
            .times(1)
            .returning(|_, _| Ok(Decision::Allow));

        let chain = build_handler_chain(
            echo_user(),
            Arc::new(UnionAuthenticator::new(vec![Arc::new(AnonymousAuthenticator)])),
            Arc::new(authz),
            DEFAULT_MAX_REQUEST_BODY_BYTES,
        );

        let (status, body) = call(chain, get("/apis/g/v1/things")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "system:anonymous false");
    }

    #[tokio::test]
    async fn allowed_request_reaches_inner_handler() {
        let chain = build_handler_chain(
            echo_user(),
            Arc::new(AnonymousAuthenticator),
            Arc::new(AlwaysAllowAuthorizer),
            DEFAULT_MAX_REQUEST_BODY_BYTES,
        );
        let (status, _) = call(chain, get("/version")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
