use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for fetchcore.
#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database connection failed: {0}")]
    DatabaseConnection(String),

    #[error("no proxies available")]
    NoProxyAvailable,

    #[error("proxy store unavailable (circuit open)")]
    StoreUnavailable,

    #[error("proxy schema missing required columns: {0}")]
    SchemaMissing(String),

    #[error("proxy error: {0}")]
    ProxyError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("http error {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("all {attempts} attempts failed: {last_error}")]
    AllAttemptsFailed { attempts: u32, last_error: String },

    #[error("proxy not found: {id}")]
    ProxyNotFound { id: i64 },

    #[error("invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("failed to decode response body: {0}")]
    DecodeError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The coarse error taxonomy the Fetch Executor classifies on, independent of
/// the concrete variant that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProxyError,
    Timeout,
    ConnectionError,
    HttpClientError,
    HttpServerError,
    StoreUnavailable,
    NoProxyAvailable,
    SchemaMissing,
    DecodeError,
    Other,
}

impl ErrorKind {
    /// Retry-eligible kinds continue the Executor's backoff loop; anything
    /// else is terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::HttpClientError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProxyError => "ProxyError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::HttpClientError => "HTTPError(4xx)",
            ErrorKind::HttpServerError => "HTTPError(5xx)",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::NoProxyAvailable => "NoProxyAvailable",
            ErrorKind::SchemaMissing => "SchemaMissing",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::Other => "UnknownError",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProxyError(_) => ErrorKind::ProxyError,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ConnectionError(_) => ErrorKind::ConnectionError,
            Error::HttpError { status, .. } if (400..500).contains(status) => {
                ErrorKind::HttpClientError
            }
            Error::HttpError { .. } => ErrorKind::HttpServerError,
            Error::StoreUnavailable => ErrorKind::StoreUnavailable,
            Error::NoProxyAvailable => ErrorKind::NoProxyAvailable,
            Error::SchemaMissing(_) => ErrorKind::SchemaMissing,
            Error::DecodeError(_) => ErrorKind::DecodeError,
            Error::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Error::Http(e) if e.is_connect() => ErrorKind::ConnectionError,
            Error::Http(e) => match e.status() {
                Some(s) if s.is_client_error() => ErrorKind::HttpClientError,
                Some(s) if s.is_server_error() => ErrorKind::HttpServerError,
                _ => ErrorKind::Other,
            },
            _ => ErrorKind::Other,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidProxyAddress(_)
            | Error::UnsupportedScheme(_)
            | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            Error::ProxyNotFound { .. } => StatusCode::NOT_FOUND,

            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,

            Error::ProxyError(_)
            | Error::ConnectionError(_)
            | Error::AllAttemptsFailed { .. } => StatusCode::BAD_GATEWAY,

            Error::HttpError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            Error::NoProxyAvailable | Error::StoreUnavailable | Error::DatabaseConnection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Error::Database(_)
            | Error::Io(_)
            | Error::Http(_)
            | Error::MissingEnvVar(_)
            | Error::SchemaMissing(_)
            | Error::DecodeError(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "kind": self.kind().as_str(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidProxyAddress(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            Error::InvalidProxyAddress("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::ProxyNotFound { id: 1 }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::NoProxyAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::StoreUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn client_server_helpers() {
        assert!(Error::InvalidProxyAddress("bad".into()).is_client_error());
        assert!(!Error::InvalidProxyAddress("bad".into()).is_server_error());

        assert!(Error::NoProxyAvailable.is_server_error());
        assert!(!Error::NoProxyAvailable.is_client_error());
    }

    #[test]
    fn kind_classifies_http_errors_by_status() {
        assert_eq!(
            Error::HttpError {
                status: 404,
                message: "not found".into()
            }
            .kind(),
            ErrorKind::HttpClientError
        );
        assert_eq!(
            Error::HttpError {
                status: 503,
                message: "unavailable".into()
            }
            .kind(),
            ErrorKind::HttpServerError
        );
        assert!(!ErrorKind::HttpClientError.is_retryable());
        assert!(ErrorKind::HttpServerError.is_retryable());
    }
}
