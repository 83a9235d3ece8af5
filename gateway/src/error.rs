//! The gateway's typed error enum (spec.md §7), with an `IntoResponse` impl
//! so handlers can return `Result<T, Error>` directly — the teacher's own
//! handlers return `anyhow::Error`-flavored responses (e.g.
//! `(StatusCode, String)` tuples); we keep that HTTP-facing convenience but
//! with named variants instead of an opaque string.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("upstream disconnected")]
    Disconnected,
    #[error("not implemented")]
    Unimplemented,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InputInvalid(String),
    #[error("fatal i/o error: {0}")]
    IoFatal(String),
}

impl From<shared_types::RpcError> for Error {
    fn from(e: shared_types::RpcError) -> Self {
        match e {
            shared_types::RpcError::Disconnected => Error::Disconnected,
            shared_types::RpcError::Unimplemented => Error::Unimplemented,
            shared_types::RpcError::Unauthorized => Error::Unauthorized,
            shared_types::RpcError::Forbidden => Error::Forbidden,
            shared_types::RpcError::NotFound => Error::NotFound,
            shared_types::RpcError::InputInvalid(s) => Error::InputInvalid(s),
            shared_types::RpcError::IoFatal(s) => Error::IoFatal(s),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoFatal(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Error::Disconnected => StatusCode::BAD_GATEWAY,
            Error::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::InputInvalid(_) => StatusCode::BAD_REQUEST,
            Error::IoFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
