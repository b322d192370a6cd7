//! Service error taxonomy and its HTTP mapping.

use crate::archive::ArchiveError;
use crate::runtime::RuntimeError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Why copying files into a sandbox failed.
#[derive(Debug, Error)]
pub enum TransferFailure {
    #[error(transparent)]
    Encode(#[from] ArchiveError),
    #[error(transparent)]
    Copy(#[from] RuntimeError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("provisioning sandbox for {image}: {source}")]
    Provision {
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("transferring files to sandbox {sandbox}: {source}")]
    Transfer {
        sandbox: String,
        #[source]
        source: TransferFailure,
    },
    #[error("executing in sandbox {sandbox}: {source}")]
    Exec {
        sandbox: String,
        #[source]
        source: RuntimeError,
    },
    #[error("session: {0}")]
    Session(#[from] serde_json::Error),
    #[error("rendering page: {0}")]
    Render(#[from] askama::Error),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        let err = Error::Exec {
            sandbox: "abc".into(),
            source: RuntimeError::Api {
                status: 409,
                message: "container is not running".into(),
            },
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("container is not running"));
    }
}
