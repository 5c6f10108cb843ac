//! Request authentication
//!
//! Authenticators inspect a request and either identify the caller, decline
//! (no credentials they understand), or reject it. Composition follows the
//! Kubernetes delegated setup:
//!
//! 1. the loopback bearer token (the server calling itself)
//! 2. TokenReview against the remote cluster, when a kubeconfig is configured
//! 3. anonymous, when enabled and no earlier authenticator rejected the request

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

use crate::error::{ApiError, ApiResult};

/// User the server authenticates as over loopback
pub const USER_APISERVER: &str = "system:apiserver";
/// User assigned to unauthenticated requests
pub const USER_ANONYMOUS: &str = "system:anonymous";
/// Superuser group
pub const GROUP_MASTERS: &str = "system:masters";
/// Group of every authenticated user
pub const GROUP_AUTHENTICATED: &str = "system:authenticated";
/// Group of the anonymous user
pub const GROUP_UNAUTHENTICATED: &str = "system:unauthenticated";

/// Authenticated identity attached to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// User name
    pub name: String,
    /// Group memberships
    pub groups: Vec<String>,
}

impl UserInfo {
    /// The anonymous user
    pub fn anonymous() -> Self {
        Self {
            name: USER_ANONYMOUS.to_string(),
            groups: vec![GROUP_UNAUTHENTICATED.to_string()],
        }
    }
}

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Identifies the caller of a request
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(Some)` identifies the caller, `Ok(None)` declines, `Err` rejects
    async fn authenticate(&self, request: &Parts) -> ApiResult<Option<UserInfo>>;
}

/// Accepts the server's own loopback bearer token
pub struct LoopbackTokenAuthenticator {
    token: String,
}

impl LoopbackTokenAuthenticator {
    /// Accept `token` as the loopback credential
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for LoopbackTokenAuthenticator {
    async fn authenticate(&self, request: &Parts) -> ApiResult<Option<UserInfo>> {
        let Some(presented) = extract_bearer_token(&request.headers) else {
            return Ok(None);
        };
        let matches = aws_lc_rs::constant_time::verify_slices_are_equal(
            presented.as_bytes(),
            self.token.as_bytes(),
        )
        .is_ok();
        if !matches {
            return Ok(None);
        }
        Ok(Some(UserInfo {
            name: USER_APISERVER.to_string(),
            groups: vec![GROUP_MASTERS.to_string(), GROUP_AUTHENTICATED.to_string()],
        }))
    }
}

/// Validates bearer tokens with the remote cluster's TokenReview API
pub struct TokenReviewAuthenticator {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl TokenReviewAuthenticator {
    /// Create an authenticator backed by `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Restrict accepted tokens to the given audiences
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = Some(audiences);
        self
    }
}

#[async_trait]
impl Authenticator for TokenReviewAuthenticator {
    async fn authenticate(&self, request: &Parts) -> ApiResult<Option<UserInfo>> {
        let Some(token) = extract_bearer_token(&request.headers) else {
            return Ok(None);
        };

        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| ApiError::Unauthorized(format!("token review failed: {}", e)))?;
        let status = result
            .status
            .ok_or_else(|| ApiError::Unauthorized("token review returned no status".into()))?;

        user_from_review(&status).map(Some)
    }
}

fn user_from_review(status: &TokenReviewStatus) -> ApiResult<UserInfo> {
    if !status.authenticated.unwrap_or(false) {
        let message = status.error.as_deref().unwrap_or("invalid bearer token");
        return Err(ApiError::Unauthorized(message.to_string()));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| ApiError::Unauthorized("token review returned no user".into()))?;
    let name = user
        .username
        .clone()
        .ok_or_else(|| ApiError::Unauthorized("token review user has no name".into()))?;
    let groups = user.groups.clone().unwrap_or_default();

    debug!(user = %name, ?groups, "token review authenticated request");
    Ok(UserInfo { name, groups })
}

/// Identifies every request as the anonymous user
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _request: &Parts) -> ApiResult<Option<UserInfo>> {
        Ok(Some(UserInfo::anonymous()))
    }
}

/// Tries authenticators in order; the first identification wins
pub struct UnionAuthenticator {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl UnionAuthenticator {
    /// Combine `authenticators`, tried in order
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }
}

#[async_trait]
impl Authenticator for UnionAuthenticator {
    async fn authenticate(&self, request: &Parts) -> ApiResult<Option<UserInfo>> {
        let mut last_error = None;
        for authenticator in &self.authenticators {
            match authenticator.authenticate(request).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "authenticator rejected request, trying next");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Falls back to `fallback` only when `primary` neither identified nor rejected
///
/// Used for anonymous access: a request carrying a bad token is rejected
/// instead of being downgraded to anonymous.
pub struct FailOnErrorAuthenticator {
    primary: Arc<dyn Authenticator>,
    fallback: Arc<dyn Authenticator>,
}

impl FailOnErrorAuthenticator {
    /// Combine `primary` with `fallback`
    pub fn new(primary: Arc<dyn Authenticator>, fallback: Arc<dyn Authenticator>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Authenticator for FailOnErrorAuthenticator {
    async fn authenticate(&self, request: &Parts) -> ApiResult<Option<UserInfo>> {
        match self.primary.authenticate(request).await? {
            Some(user) => Ok(Some(user)),
            None => self.fallback.authenticate(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use k8s_openapi::api::authentication::v1::UserInfo as ReviewUser;

    fn parts(token: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/apis/g/v1/things");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap().into_parts().0
    }

    struct Rejecting;

    #[async_trait]
    impl Authenticator for Rejecting {
        async fn authenticate(&self, _request: &Parts) -> ApiResult<Option<UserInfo>> {
            Err(ApiError::Unauthorized("bad token".into()))
        }
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(
            extract_bearer_token(&parts(Some("abc123")).headers),
            Some("abc123")
        );
        assert_eq!(extract_bearer_token(&parts(None).headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn loopback_token_identifies_the_server() {
        let authn = LoopbackTokenAuthenticator::new("secret");

        let user = authn
            .authenticate(&parts(Some("secret")))
            .await
            .unwrap()
            .expect("loopback token should authenticate");
        assert_eq!(user.name, USER_APISERVER);
        assert!(user.groups.contains(&GROUP_MASTERS.to_string()));

        assert!(authn
            .authenticate(&parts(Some("other")))
            .await
            .unwrap()
            .is_none());
        assert!(authn.authenticate(&parts(None)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn union_returns_first_identification() {
        let union = UnionAuthenticator::new(vec![
            Arc::new(LoopbackTokenAuthenticator::new("secret")),
            Arc::new(AnonymousAuthenticator),
        ]);

        let user = union.authenticate(&parts(None)).await.unwrap().unwrap();
        assert_eq!(user, UserInfo::anonymous());

        let user = union
            .authenticate(&parts(Some("secret")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, USER_APISERVER);
    }

    #[tokio::test]
    async fn union_surfaces_rejection_when_nobody_identifies() {
        let union = UnionAuthenticator::new(vec![
            Arc::new(Rejecting),
            Arc::new(LoopbackTokenAuthenticator::new("secret")),
        ]);
        assert!(matches!(
            union.authenticate(&parts(Some("x"))).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn anonymous_fallback_does_not_mask_bad_tokens() {
        let authn = FailOnErrorAuthenticator::new(
            Arc::new(Rejecting),
            Arc::new(AnonymousAuthenticator),
        );
        assert!(authn.authenticate(&parts(Some("x"))).await.is_err());

        let authn = FailOnErrorAuthenticator::new(
            Arc::new(UnionAuthenticator::new(vec![])),
            Arc::new(AnonymousAuthenticator),
        );
        let user = authn.authenticate(&parts(None)).await.unwrap().unwrap();
        assert_eq!(user.name, USER_ANONYMOUS);
    }

    #[test]
    fn token_review_status_mapping() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(ReviewUser {
                username: Some("alice".to_string()),
                groups: Some(vec!["dev".to_string()]),
                uid: None,
                extra: None,
            }),
            error: None,
            audiences: None,
        };
        let user = user_from_review(&status).unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.groups, vec!["dev".to_string()]);

        let rejected = TokenReviewStatus {
            authenticated: Some(false),
            error: Some("token expired".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            user_from_review(&rejected),
            Err(ApiError::Unauthorized(msg)) if msg == "token expired"
        ));
    }
}
