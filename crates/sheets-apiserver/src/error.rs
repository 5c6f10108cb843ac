//! Error types for server assembly and request handling

use std::path::PathBuf;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use sheets_pki::PkiError;

/// Options assembly, validation and completion failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Options failed validation; every problem is listed
    #[error("invalid options: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// A kubeconfig could not be read or resolved
    #[error("failed to load kubeconfig {path}: {message}")]
    Kubeconfig {
        /// Kubeconfig path, or `<loopback>` for the in-memory loopback config
        path: String,
        /// Underlying error
        message: String,
    },

    /// A Kubernetes client could not be built
    #[error("failed to build client: {0}")]
    Client(String),

    /// Serving certificate or key could not be read
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Self-signed certificate generation failed
    #[error("failed to generate serving certificate: {0}")]
    Pki(#[from] PkiError),

    /// Loopback token generation failed
    #[error("failed to generate loopback token: RNG unavailable")]
    TokenGeneration,

    /// The admission initializer hook failed
    #[error("admission initializer hook failed: {0}")]
    Admission(String),

    /// A feature was enabled that this server cannot provide
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
}

/// Server construction failures
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// A post-start hook with this name is already registered
    #[error("post-start hook {0:?} is already registered")]
    DuplicatePostStartHook(String),

    /// A handler is already registered for this path
    #[error("a handler is already registered for path {0:?}")]
    DuplicatePath(String),

    /// Serving TLS material was rejected
    #[error("invalid serving certificate: {0}")]
    Tls(String),
}

/// Kubeconfig persistence failures
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Kubeconfig could not be serialized
    #[error("failed to serialize kubeconfig: {0}")]
    Serialize(#[from] serde_yaml::Error),

    /// Kubeconfig could not be written
    #[error("failed to write kubeconfig {path}: {source}")]
    Write {
        /// Destination path
        path: PathBuf,
        /// Underlying write error
        #[source]
        source: PkiError,
    },

    /// Kubeconfig could not be read back
    #[error("failed to read kubeconfig {path}: {source}")]
    Read {
        /// Source path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the running server
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Binding or serving failed
    #[error("serve failed: {0}")]
    Io(#[from] std::io::Error),

    /// A post-start hook failed
    #[error("post-start hook {name:?} failed: {message}")]
    PostStartHook {
        /// Hook name
        name: String,
        /// Failure reason
        message: String,
    },

    /// The serve task panicked or was aborted
    #[error("serve task failed: {0}")]
    Join(String),
}

/// Result type for request handling
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// HTTP-level failures rendered as Kubernetes `Status` objects
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authorization denied the request
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Nothing serves this path
    #[error("not found: {0}")]
    NotFound(String),

    /// Method not supported on this path
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Request could not be read
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Request body exceeds the configured limit
    #[error("request entity too large: limit is {0} bytes")]
    RequestEntityTooLarge(u64),

    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code of this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RequestEntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::MethodNotAllowed(_) => "MethodNotAllowed",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::RequestEntityTooLarge(_) => "RequestEntityTooLarge",
            ApiError::Internal(_) => "InternalError",
        }
    }

    /// Kubernetes `Status` describing this error
    pub fn to_status(&self) -> Status {
        Status {
            code: Some(i32::from(self.status_code().as_u16())),
            message: Some(self.to_string()),
            reason: Some(self.reason().to_string()),
            status: Some("Failure".to_string()),
            ..Default::default()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match serde_json::to_vec(&self.to_status()) {
            Ok(body) => {
                (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
            }
            Err(_) => (status, self.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_error_renders_kubernetes_status() {
        let response = ApiError::Forbidden("user cannot get widgets".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "Status");
        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["status"], "Failure");
        assert_eq!(json["reason"], "Forbidden");
        assert_eq!(json["code"], 403);
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("user cannot get widgets"));
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::RequestEntityTooLarge(10).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Unauthorized(String::new()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn invalid_options_lists_every_problem() {
        let err = ConfigError::Invalid(vec!["bad port".into(), "missing kubeconfig".into()]);
        assert_eq!(
            err.to_string(),
            "invalid options: bad port; missing kubeconfig"
        );
    }
}
