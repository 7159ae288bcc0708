//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use filegate_core::CoreError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    /// Missing `Authorization` header.
    AuthMissing,

    /// Malformed `Authorization` header or token.
    AuthMalformed,

    /// Token rejected.
    AuthRejected,

    /// Invalid tenant id.
    TenantInvalid,

    /// Filename is invalid or a sub-path was attempted.
    FilenameInvalid,

    /// The requested file does not exist.
    NotFound,

    /// {0}
    PolicyRejected(String),

    /// Range is not satisfiable.
    RangeUnsatisfiable,

    /// Multi-range requests are not supported.
    RangeMultipart,

    /// Precondition failed: resource has changed.
    PreconditionFailed,

    /// chunk_order_incorrect
    ChunkOutOfOrder,

    /// Chunk already exists on disk.
    ChunkDuplicate,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components.
    CoreError(CoreError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::AuthMissing => "AuthMissing",
            Self::AuthMalformed => "AuthMalformed",
            Self::AuthRejected => "AuthRejected",
            Self::TenantInvalid => "TenantInvalid",
            Self::FilenameInvalid => "FilenameInvalid",
            Self::NotFound => "NotFound",
            Self::PolicyRejected(_) => "PolicyRejected",
            Self::RangeUnsatisfiable => "RangeUnsatisfiable",
            Self::RangeMultipart => "RangeMultipart",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::ChunkOutOfOrder => "ChunkOutOfOrder",
            Self::ChunkDuplicate => "ChunkDuplicate",
            Self::InternalServerError => "InternalServerError",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::RequestError(_) => "RequestError",
            Self::CoreError(e) => e.name(),
        }
    }

    /// Returns a version of this error safe to serialize to a client:
    /// internal causes are collapsed, never their `Display` text.
    fn into_clients(self) -> Self {
        match self {
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(_) => Self::InternalServerError,
            Self::CoreError(_) => Self::InternalServerError,

            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::AuthMissing => StatusCode::BAD_REQUEST,
            Self::AuthMalformed => StatusCode::BAD_REQUEST,
            Self::AuthRejected => StatusCode::UNAUTHORIZED,
            Self::TenantInvalid => StatusCode::BAD_REQUEST,
            Self::FilenameInvalid => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PolicyRejected(_) => StatusCode::BAD_REQUEST,
            Self::RangeUnsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::RangeMultipart => StatusCode::METHOD_NOT_ALLOWED,
            Self::PreconditionFailed => StatusCode::BAD_REQUEST,
            Self::ChunkOutOfOrder => StatusCode::BAD_REQUEST,
            Self::ChunkDuplicate => StatusCode::BAD_REQUEST,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this is the out-of-order chunk error, which the edge proxy
    /// must rewrite to 400 even if the inner handler reported 200 to keep
    /// the proxied channel well-formed.
    pub fn is_chunk_order_incorrect(&self) -> bool {
        matches!(self, Self::ChunkOutOfOrder)
    }
}

impl StdError for ServerError {}

impl From<CoreError> for ServerError {
    fn from(error: CoreError) -> Self {
        Self::CoreError(error)
    }
}

impl From<filegate_token::Error> for ServerError {
    fn from(error: filegate_token::Error) -> Self {
        match error {
            filegate_token::Error::RoleDenied => Self::AuthRejected,
            other => Self::AuthMalformed.with_cause(other),
        }
    }
}

impl ServerError {
    fn with_cause(self, cause: impl StdError + Send + Sync + 'static) -> Self {
        tracing::debug!(%cause, "auth failure cause");
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_) | Self::StorageError(_) | Self::CoreError(_)
        ) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.into_clients();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}
