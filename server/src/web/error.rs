//! The single place worker and pipeline failures become HTTP responses.
//!
//! Handlers return `Result<_, WebError>`; nothing else in the crate formats
//! error bodies. Every 4xx/5xx body is a [`RequestError`] document, except
//! the 404s for missing packages and question states, which carry a
//! [`NotFoundStatus`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use tracing::info;

use super::models::NotFoundStatus;
use super::models::NotFoundStatusWhat;
use super::models::RequestError;
use super::models::RequestErrorCode;
use crate::cache::CacheError;
use crate::collector::CollectorError;
use crate::indexer::IndexerError;
use crate::worker::WorkerError;

#[derive(thiserror::Error, Debug)]
pub enum WebError {
    #[error("invalid request body was provided: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid package was provided: {reason}")]
    InvalidPackage { reason: String, temporary: bool },

    #[error("an error occurred within the package: {reason}")]
    PackageError { reason: String, temporary: bool },

    #[error("question package reached its memory limit")]
    OutOfMemory { reason: String },

    #[error("question package did not answer in a reasonable amount of time")]
    WorkerTimeout { reason: String },

    #[error("there was an internal server error: {reason}")]
    Server { reason: String, temporary: bool },

    #[error("not found")]
    NotFound { what: NotFoundStatusWhat },

    #[error("static file not found")]
    StaticFileNotFound,

    #[error("a request part exceeds its size limit of {max_size} bytes")]
    PayloadTooLarge { max_size: u64 },

    #[error("unsupported content type '{content_type}'")]
    UnsupportedMediaType { content_type: String },
}

impl WebError {
    pub fn server(reason: impl Into<String>) -> Self {
        Self::Server {
            reason: reason.into(),
            temporary: true,
        }
    }

    fn request_error(&self) -> Option<(StatusCode, RequestError)> {
        let (status, error_code, temporary, reason) = match self {
            Self::InvalidRequest { reason } => (
                StatusCode::BAD_REQUEST,
                RequestErrorCode::InvalidRequest,
                false,
                Some(reason.clone()),
            ),
            Self::InvalidPackage { reason, temporary } => (
                StatusCode::BAD_REQUEST,
                RequestErrorCode::InvalidPackage,
                *temporary,
                Some(reason.clone()),
            ),
            Self::PackageError { reason, temporary } => (
                StatusCode::BAD_REQUEST,
                RequestErrorCode::PackageError,
                *temporary,
                Some(reason.clone()),
            ),
            Self::OutOfMemory { reason } => (
                StatusCode::BAD_REQUEST,
                RequestErrorCode::OutOfMemory,
                true,
                Some(reason.clone()),
            ),
            Self::WorkerTimeout { reason } => (
                StatusCode::BAD_REQUEST,
                RequestErrorCode::WorkerTimeout,
                true,
                Some(reason.clone()),
            ),
            Self::Server { reason, temporary } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                RequestErrorCode::ServerError,
                *temporary,
                Some(reason.clone()),
            ),
            Self::PayloadTooLarge { max_size } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                RequestErrorCode::InvalidRequest,
                false,
                Some(format!("a request part exceeds its size limit of {max_size} bytes")),
            ),
            Self::UnsupportedMediaType { content_type } => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                RequestErrorCode::InvalidRequest,
                false,
                Some(format!(
                    "wrong content type, expected multipart/form-data or application/json, \
                     got '{content_type}'"
                )),
            ),
            Self::NotFound { .. } | Self::StaticFileNotFound => return None,
        };
        Some((
            status,
            RequestError {
                error_code,
                temporary,
                reason,
            },
        ))
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        info!("request failed: {self}");
        match self.request_error() {
            Some((status, body)) => (status, Json(body)).into_response(),
            None => match self {
                Self::NotFound { what } => {
                    (StatusCode::NOT_FOUND, Json(NotFoundStatus { what })).into_response()
                }
                Self::StaticFileNotFound => {
                    (StatusCode::NOT_FOUND, "File not found.").into_response()
                }
                // request_error covered everything else.
                other => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RequestError {
                        error_code: RequestErrorCode::ServerError,
                        temporary: true,
                        reason: Some(other.to_string()),
                    }),
                )
                    .into_response(),
            },
        }
    }
}

impl From<WorkerError> for WebError {
    fn from(error: WorkerError) -> Self {
        let temporary = error.temporary();
        match error {
            WorkerError::NotRunning => Self::InvalidPackage {
                reason: "worker is not running".to_string(),
                temporary,
            },
            WorkerError::Start { reason, temporary } => Self::Server { reason, temporary },
            WorkerError::CpuTimeLimitExceeded { limit_seconds } => Self::WorkerTimeout {
                reason: format!("exceeded the CPU time limit of {limit_seconds}s"),
            },
            WorkerError::RealTimeLimitExceeded { limit_seconds } => Self::WorkerTimeout {
                reason: format!("exceeded the real time limit of {limit_seconds}s"),
            },
            WorkerError::MemoryExceeded { message } => Self::OutOfMemory {
                reason: message.unwrap_or_else(|| "memory limit exceeded".to_string()),
            },
            WorkerError::Package { message } => Self::PackageError {
                reason: message,
                temporary,
            },
            WorkerError::StaticFileSizeMismatch { path, expected, actual } => {
                Self::InvalidPackage {
                    reason: format!(
                        "static file '{path}' has size {actual} on disk but {expected} in the \
                         manifest"
                    ),
                    temporary: false,
                }
            }
            WorkerError::StaticFileNotFound(_) => Self::StaticFileNotFound,
            WorkerError::InvalidMessageId { .. }
            | WorkerError::Io(_)
            | WorkerError::Decode(_) => Self::Server {
                reason: error.to_string(),
                temporary,
            },
        }
    }
}

impl From<CollectorError> for WebError {
    fn from(error: CollectorError) -> Self {
        match error {
            CollectorError::NotFound => Self::NotFound {
                what: NotFoundStatusWhat::Package,
            },
            CollectorError::Cache(CacheError::ItemTooLarge { max_size, .. }) => {
                Self::PayloadTooLarge { max_size }
            }
            CollectorError::Indexer(IndexerError::ManifestResolution(worker)) => worker.into(),
            other => Self::server(other.to_string()),
        }
    }
}
