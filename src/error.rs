//! Router errors and the JSON error responses the gateway sends for them

use crate::certs::CertificateError;
use crate::cluster::ClusterError;
use crate::storage::StorageError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the router core
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no backends available")]
    NoBackends,

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("timed out waiting for backend to leave idle")]
    UnidleTimeout,

    #[error("could not unidle: {0}")]
    Unidle(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("upstream dns: {0}")]
    Upstream(String),
}

impl RouterError {
    /// Gateway error code used when this error ends a request
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RouterError::NoBackends => ProxyErrorCode::NoBackends,
            RouterError::UnidleTimeout => ProxyErrorCode::UnidleTimeout,
            RouterError::Storage(_) | RouterError::Unidle(_) | RouterError::Cluster(_) => {
                ProxyErrorCode::BackendUnavailable
            }
            RouterError::Certificate(_) | RouterError::Upstream(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Host has no targets, or is unknown
    NoBackends,
    /// Routing state could not be read, or unidle failed
    BackendUnavailable,
    /// Backend did not leave idle within the bound
    UnidleTimeout,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoBackends => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UnidleTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Router-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NoBackends => "NO_BACKENDS",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::UnidleTimeout => "UNIDLE_TIMEOUT",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Router-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Router-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
