//! Request authorization
//!
//! Authorizers return a [`Decision`]; a union asks each in turn and the first
//! one with an opinion decides. Requests nobody allows are forbidden.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::authn::{UserInfo, GROUP_MASTERS};
use crate::error::{ApiError, ApiResult};
use crate::request::RequestInfo;

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed
    Allow,
    /// The request is explicitly denied
    Deny(String),
    /// This authorizer has no opinion; ask the next one
    NoOpinion,
}

/// Decides whether a user may perform a request
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Decide on `request` performed by `user`
    async fn authorize(&self, user: &UserInfo, request: &RequestInfo) -> ApiResult<Decision>;
}

/// Named authorization postures selectable at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorizationPolicy {
    /// Allow everything (development only)
    #[default]
    AlwaysAllow,
    /// Ask the remote cluster with SubjectAccessReview
    Delegated,
    /// Deny everything not covered by always-allow paths or groups
    AlwaysDeny,
}

impl AuthorizationPolicy {
    /// Policy name as used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationPolicy::AlwaysAllow => "always-allow",
            AuthorizationPolicy::Delegated => "delegated",
            AuthorizationPolicy::AlwaysDeny => "always-deny",
        }
    }
}

impl fmt::Display for AuthorizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthorizationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always-allow" => Ok(AuthorizationPolicy::AlwaysAllow),
            "delegated" => Ok(AuthorizationPolicy::Delegated),
            "always-deny" => Ok(AuthorizationPolicy::AlwaysDeny),
            other => Err(format!(
                "unknown authorization policy {other:?}, \
                 expected always-allow, delegated or always-deny"
            )),
        }
    }
}

/// Allows non-resource requests whose path matches a configured pattern
///
/// `*` matches every path; a trailing `*` matches by prefix.
pub struct PathAuthorizer {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl PathAuthorizer {
    /// Allow the given path patterns
    pub fn new(paths: &[String]) -> Self {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for path in paths {
            let path = path.trim_start_matches('/');
            match path.strip_suffix('*') {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => exact.push(path.to_string()),
            }
        }
        Self { exact, prefixes }
    }
}

#[async_trait]
impl Authorizer for PathAuthorizer {
    async fn authorize(&self, _user: &UserInfo, request: &RequestInfo) -> ApiResult<Decision> {
        if request.is_resource_request {
            return Ok(Decision::NoOpinion);
        }
        let path = request.path.trim_start_matches('/');
        let allowed = self.exact.iter().any(|p| p == path)
            || self.prefixes.iter().any(|p| path.starts_with(p.as_str()));
        Ok(if allowed {
            Decision::Allow
        } else {
            Decision::NoOpinion
        })
    }
}

/// Allows every request from members of the configured groups
pub struct PrivilegedGroupsAuthorizer {
    groups: Vec<String>,
}

impl PrivilegedGroupsAuthorizer {
    /// Allow `groups`; `system:masters` is always included
    pub fn new(groups: &[String]) -> Self {
        let mut groups = groups.to_vec();
        if !groups.iter().any(|g| g == GROUP_MASTERS) {
            groups.push(GROUP_MASTERS.to_string());
        }
        Self { groups }
    }
}

#[async_trait]
impl Authorizer for PrivilegedGroupsAuthorizer {
    async fn authorize(&self, user: &UserInfo, _request: &RequestInfo) -> ApiResult<Decision> {
        let privileged = user.groups.iter().any(|g| self.groups.contains(g));
        Ok(if privileged {
            Decision::Allow
        } else {
            Decision::NoOpinion
        })
    }
}

/// Allows everything
pub struct AlwaysAllowAuthorizer;

#[async_trait]
impl Authorizer for AlwaysAllowAuthorizer {
    async fn authorize(&self, _user: &UserInfo, _request: &RequestInfo) -> ApiResult<Decision> {
        Ok(Decision::Allow)
    }
}

/// Denies everything
pub struct AlwaysDenyAuthorizer;

#[async_trait]
impl Authorizer for AlwaysDenyAuthorizer {
    async fn authorize(&self, _user: &UserInfo, _request: &RequestInfo) -> ApiResult<Decision> {
        Ok(Decision::Deny("everything is forbidden".to_string()))
    }
}

/// Delegates decisions to the remote cluster's SubjectAccessReview API
pub struct SubjectAccessReviewAuthorizer {
    client: Client,
}

impl SubjectAccessReviewAuthorizer {
    /// Create an authorizer backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn review_spec(user: &UserInfo, request: &RequestInfo) -> SubjectAccessReviewSpec {
    let mut spec = SubjectAccessReviewSpec {
        user: Some(user.name.clone()),
        groups: Some(user.groups.clone()),
        ..Default::default()
    };
    if request.is_resource_request {
        spec.resource_attributes = Some(ResourceAttributes {
            group: Some(request.api_group.clone()),
            version: non_empty(&request.api_version),
            resource: non_empty(&request.resource),
            subresource: non_empty(&request.subresource),
            name: non_empty(&request.name),
            namespace: non_empty(&request.namespace),
            verb: Some(request.verb.clone()),
            ..Default::default()
        });
    } else {
        spec.non_resource_attributes = Some(NonResourceAttributes {
            path: Some(request.path.clone()),
            verb: Some(request.verb.clone()),
        });
    }
    spec
}

#[async_trait]
impl Authorizer for SubjectAccessReviewAuthorizer {
    async fn authorize(&self, user: &UserInfo, request: &RequestInfo) -> ApiResult<Decision> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = SubjectAccessReview {
            metadata: Default::default(),
            spec: review_spec(user, request),
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| ApiError::Internal(format!("subject access review failed: {}", e)))?;

        let Some(status) = result.status else {
            return Ok(Decision::NoOpinion);
        };
        let reason = status.reason.unwrap_or_default();
        debug!(
            user = %user.name,
            path = %request.path,
            allowed = status.allowed,
            "subject access review"
        );
        Ok(if status.allowed {
            Decision::Allow
        } else if status.denied.unwrap_or(false) {
            Decision::Deny(reason)
        } else {
            Decision::NoOpinion
        })
    }
}

/// Asks authorizers in order; the first opinion wins
pub struct UnionAuthorizer {
    authorizers: Vec<Arc<dyn Authorizer>>,
}

impl UnionAuthorizer {
    /// Combine `authorizers`, asked in order
    pub fn new(authorizers: Vec<Arc<dyn Authorizer>>) -> Self {
        Self { authorizers }
    }
}

#[async_trait]
impl Authorizer for UnionAuthorizer {
    async fn authorize(&self, user: &UserInfo, request: &RequestInfo) -> ApiResult<Decision> {
        for authorizer in &self.authorizers {
            match authorizer.authorize(user, request).await? {
                Decision::NoOpinion => continue,
                decision => return Ok(decision),
            }
        }
        Ok(Decision::NoOpinion)
    }
}

/// Build a forbidden error for a request that was not allowed
pub fn forbidden(user: &UserInfo, request: &RequestInfo, decision: &Decision) -> ApiError {
    let target = if request.is_resource_request {
        format!(
            "{} resource {:?} in API group {:?}",
            request.verb, request.resource, request.api_group
        )
    } else {
        format!("{} path {:?}", request.verb, request.path)
    };
    let mut message = format!("User {:?} cannot {}", user.name, target);
    if let Decision::Deny(reason) = decision {
        if !reason.is_empty() {
            message.push_str(": ");
            message.push_str(reason);
        }
    }
    ApiError::Forbidden(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::{GROUP_UNAUTHENTICATED, USER_ANONYMOUS};
    use axum::http::Method;

    fn request(method: Method, path: &str) -> RequestInfo {
        RequestInfo::new(&method, &path.parse().unwrap())
    }

    fn user(groups: &[&str]) -> UserInfo {
        UserInfo {
            name: "alice".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn policy_parses_and_displays() {
        for policy in [
            AuthorizationPolicy::AlwaysAllow,
            AuthorizationPolicy::Delegated,
            AuthorizationPolicy::AlwaysDeny,
        ] {
            assert_eq!(policy.to_string().parse::<AuthorizationPolicy>(), Ok(policy));
        }
        assert!("allow-some".parse::<AuthorizationPolicy>().is_err());
        assert_eq!(AuthorizationPolicy::default(), AuthorizationPolicy::AlwaysAllow);
    }

    #[tokio::test]
    async fn star_path_allows_every_non_resource_request() {
        let authz = PathAuthorizer::new(&["*".to_string()]);
        let anyone = user(&[]);

        assert_eq!(
            authz.authorize(&anyone, &request(Method::GET, "/healthz")).await.unwrap(),
            Decision::Allow
        );
        assert_eq!(
            authz
                .authorize(&anyone, &request(Method::GET, "/apis/g/v1/things"))
                .await
                .unwrap(),
            Decision::NoOpinion
        );
    }

    #[tokio::test]
    async fn path_patterns_match_exactly_or_by_prefix() {
        let authz = PathAuthorizer::new(&["/healthz".to_string(), "/openapi/*".to_string()]);
        let anyone = user(&[]);

        for (path, expected) in [
            ("/healthz", Decision::Allow),
            ("/healthz/ping", Decision::NoOpinion),
            ("/openapi/v2", Decision::Allow),
            ("/version", Decision::NoOpinion),
        ] {
            assert_eq!(
                authz.authorize(&anyone, &request(Method::GET, path)).await.unwrap(),
                expected,
                "{path}"
            );
        }
    }

    #[tokio::test]
    async fn privileged_groups_include_masters() {
        let authz = PrivilegedGroupsAuthorizer::new(&[GROUP_UNAUTHENTICATED.to_string()]);
        let req = request(Method::DELETE, "/apis/g/v1/things/x");

        let anonymous = UserInfo {
            name: USER_ANONYMOUS.to_string(),
            groups: vec![GROUP_UNAUTHENTICATED.to_string()],
        };
        assert_eq!(authz.authorize(&anonymous, &req).await.unwrap(), Decision::Allow);
        assert_eq!(
            authz.authorize(&user(&[GROUP_MASTERS]), &req).await.unwrap(),
            Decision::Allow
        );
        assert_eq!(
            authz.authorize(&user(&["dev"]), &req).await.unwrap(),
            Decision::NoOpinion
        );
    }

    #[tokio::test]
    async fn union_takes_first_opinion() {
        let mut no_opinion = MockAuthorizer::new();
        no_opinion
            .expect_authorize()
            .times(1)
            .returning(|_, _| Ok(Decision::NoOpinion));
        let mut deny = MockAuthorizer::new();
        deny.expect_authorize()
            .times(1)
            .returning(|_, _| Ok(Decision::Deny("nope".into())));
        let mut never = MockAuthorizer::new();
        never.expect_authorize().times(0);

        let union = UnionAuthorizer::new(vec![
            Arc::new(no_opinion),
            Arc::new(deny),
            Arc::new(never),
        ]);
        let decision = union
            .authorize(&user(&[]), &request(Method::GET, "/x"))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny("nope".into()));
    }

    #[tokio::test]
    async fn empty_union_has_no_opinion() {
        let union = UnionAuthorizer::new(vec![]);
        let decision = union
            .authorize(&user(&[]), &request(Method::GET, "/x"))
            .await
            .unwrap();
        assert_eq!(decision, Decision::NoOpinion);
    }

    #[test]
    fn review_spec_carries_resource_attributes() {
        let req = request(Method::GET, "/apis/g/v1/namespaces/ns/things/t");
        let spec = review_spec(&user(&["dev"]), &req);

        let attrs = spec.resource_attributes.unwrap();
        assert_eq!(attrs.group.as_deref(), Some("g"));
        assert_eq!(attrs.namespace.as_deref(), Some("ns"));
        assert_eq!(attrs.resource.as_deref(), Some("things"));
        assert_eq!(attrs.name.as_deref(), Some("t"));
        assert_eq!(attrs.verb.as_deref(), Some("get"));
        assert!(spec.non_resource_attributes.is_none());
        assert_eq!(spec.user.as_deref(), Some("alice"));
    }

    #[test]
    fn review_spec_carries_non_resource_attributes() {
        let spec = review_spec(&user(&[]), &request(Method::GET, "/healthz"));
        let attrs = spec.non_resource_attributes.unwrap();
        assert_eq!(attrs.path.as_deref(), Some("/healthz"));
        assert_eq!(attrs.verb.as_deref(), Some("get"));
    }

    #[test]
    fn forbidden_message_names_user_and_target() {
        let err = forbidden(
            &user(&[]),
            &request(Method::GET, "/apis/g/v1/things"),
            &Decision::Deny("policy says no".into()),
        );
        let message = err.to_string();
        assert!(message.contains("\"alice\""));
        assert!(message.contains("things"));
        assert!(message.contains("policy says no"));
    }
}
