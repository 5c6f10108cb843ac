//! Request classification
//!
//! Splits a request path into the attributes authorization works on,
//! following the Kubernetes API path grammar:
//!
//! ```text
//! /api/{version}/{resource}/{name}/{subresource}
//! /api/{version}/namespaces/{namespace}/{resource}/{name}/{subresource}
//! /apis/{group}/{version}/...
//! ```
//!
//! Anything else, including discovery paths such as `/apis/{group}` and
//! `/apis/{group}/{version}`, is a non-resource request.

use axum::http::{Method, Uri};

const API_PREFIXES: [&str; 2] = ["api", "apis"];
const GROUPLESS_PREFIX: &str = "api";

/// Attributes of a request as seen by authorization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Whether the path addresses an API resource
    pub is_resource_request: bool,
    /// Request path
    pub path: String,
    /// Kubernetes verb (`get`, `list`, `watch`, `create`, ...) or the
    /// lowercase HTTP method for non-resource requests
    pub verb: String,
    /// `api` or `apis`
    pub api_prefix: String,
    /// API group, empty for the core group
    pub api_group: String,
    /// API version
    pub api_version: String,
    /// Namespace, empty for cluster-scoped requests
    pub namespace: String,
    /// Resource name (plural)
    pub resource: String,
    /// Subresource
    pub subresource: String,
    /// Object name
    pub name: String,
    /// Path segments after the namespace
    pub parts: Vec<String>,
}

impl RequestInfo {
    /// Classify a request from its method and URI
    pub fn new(method: &Method, uri: &Uri) -> Self {
        let path = uri.path().to_string();
        let mut info = RequestInfo {
            path: path.clone(),
            verb: method.as_str().to_ascii_lowercase(),
            ..Default::default()
        };

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if segments.len() < 3 || !API_PREFIXES.contains(&segments[0]) {
            return info;
        }
        info.api_prefix = segments[0].to_string();
        let mut rest = &segments[1..];

        if info.api_prefix != GROUPLESS_PREFIX {
            if rest.len() < 3 {
                return info;
            }
            info.api_group = rest[0].to_string();
            rest = &rest[1..];
        }

        info.is_resource_request = true;
        info.api_version = rest[0].to_string();
        rest = &rest[1..];

        info.verb = match *method {
            Method::POST => "create",
            Method::GET | Method::HEAD => "get",
            Method::PUT => "update",
            Method::PATCH => "patch",
            Method::DELETE => "delete",
            _ => "",
        }
        .to_string();

        let mut watch = false;
        if rest.first() == Some(&"watch") {
            watch = true;
            rest = &rest[1..];
        }

        if rest.first() == Some(&"namespaces") {
            if rest.len() > 1 {
                info.namespace = rest[1].to_string();
                // /namespaces/{name}/{subresource} addresses the namespace itself
                if rest.len() > 2 && !is_namespace_subresource(rest[2]) {
                    rest = &rest[2..];
                }
            }
        }

        info.parts = rest.iter().map(|s| s.to_string()).collect();
        if let Some(resource) = rest.first() {
            info.resource = resource.to_string();
        }
        if let Some(name) = rest.get(1) {
            info.name = name.to_string();
        }
        if let Some(sub) = rest.get(2) {
            info.subresource = sub.to_string();
        }

        if watch || query_flag(uri, "watch") {
            if info.verb == "get" {
                info.verb = "watch".to_string();
            }
        } else if info.name.is_empty() && info.verb == "get" {
            info.verb = "list".to_string();
        }
        if info.name.is_empty() && info.verb == "delete" {
            info.verb = "deletecollection".to_string();
        }

        info
    }
}

fn is_namespace_subresource(segment: &str) -> bool {
    matches!(segment, "status" | "finalize")
}

fn query_flag(uri: &Uri, key: &str) -> bool {
    uri.query()
        .map(|q| {
            q.split('&').any(|pair| match pair.split_once('=') {
                Some((k, v)) => k == key && matches!(v, "1" | "true" | "True"),
                None => false,
            })
        })
        .unwrap_or(false)
}
