// =============================================================================
// Palaver Matrix Homeserver - Error Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Crate-wide error type and the Matrix error-code taxonomy. Every fallible
//   operation in the server funnels into this type; the resource layer maps
//   it onto the standard Matrix error body and HTTP status.
//
// Features:
//   • thiserror-derived error enum
//   • Matrix errcode mapping (M_FORBIDDEN, M_NOT_FOUND, ...)
//   • axum IntoResponse integration
//
// Dependencies:
//   • Error handling with thiserror
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The abstract kind of a failure, independent of where it was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input could not be parsed at all: bad JSON, bad MXID.
    MalformedInput,
    /// Input parsed but is semantically invalid: missing fields, oversize.
    Invalid,
    /// Authorization denied under the room rules or access controls.
    Auth,
    /// A hash or signature did not verify.
    Verify,
    /// Idempotent re-insertion; informational unless a caller opts otherwise.
    Exists,
    /// Missing state, peer, or key.
    NotFound,
    /// Network failure or timeout; retryable.
    Transient,
    /// Cooperative cancellation.
    Interrupted,
    /// Invariant violation; fatal for the operation.
    Internal,
}

impl ErrorKind {
    /// The wire errcode for this kind of failure.
    pub fn errcode(&self) -> &'static str {
        match self {
            ErrorKind::MalformedInput => "M_BAD_JSON",
            ErrorKind::Invalid => "M_INVALID_PARAM",
            ErrorKind::Auth => "M_FORBIDDEN",
            ErrorKind::Verify => "M_FORBIDDEN",
            ErrorKind::Exists => "M_ROOM_IN_USE",
            ErrorKind::NotFound => "M_NOT_FOUND",
            ErrorKind::Transient => "M_LIMIT_EXCEEDED",
            ErrorKind::Interrupted => "M_UNKNOWN",
            ErrorKind::Internal => "M_UNKNOWN",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::MalformedInput | ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Auth | ErrorKind::Verify => StatusCode::FORBIDDEN,
            ErrorKind::Exists => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transient => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Interrupted | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Palaver global error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{1}")]
    BadRequest(ErrorKind, &'static str),

    #[error("{1}")]
    BadRequestString(ErrorKind, String),

    #[error("Bad JSON: {0}")]
    BadJson(String),

    #[error("JSON nesting exceeds the canonical bound")]
    TooDeep,

    #[error("Bad pagination: {0}")]
    BadPagination(&'static str),

    #[error("Bad configuration: {0}")]
    BadConfig(&'static str),

    #[error("Bad database: {0}")]
    BadDatabase(&'static str),

    #[error("Bad server response: {0}")]
    BadServerResponse(&'static str),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Federation request failed: {0}")]
    Federation(#[from] reqwest::Error),
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("Bad database: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("Bad config: {}", message);
        Self::BadConfig(message)
    }

    /// The abstract kind this error maps to on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(kind, _) | Error::BadRequestString(kind, _) => *kind,
            Error::BadJson(_) | Error::TooDeep => ErrorKind::MalformedInput,
            Error::BadPagination(_) => ErrorKind::Invalid,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Federation(_) => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    pub fn to_response(&self) -> Response {
        let kind = self.kind();
        let errcode = match self {
            Error::BadPagination(_) => "M_BAD_PAGINATION",
            _ => kind.errcode(),
        };

        let body = json!({
            "errcode": errcode,
            "error": self.to_string(),
        });

        (kind.status(), Json(body)).into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        self.to_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_403() {
        let error = Error::BadRequest(ErrorKind::Auth, "Event is not authorized");
        assert_eq!(error.kind().status(), StatusCode::FORBIDDEN);
        assert_eq!(error.kind().errcode(), "M_FORBIDDEN");
    }

    #[test]
    fn bad_json_is_malformed_input() {
        let error = Error::BadJson("unexpected end of input".to_owned());
        assert_eq!(error.kind(), ErrorKind::MalformedInput);
        assert_eq!(error.kind().errcode(), "M_BAD_JSON");
    }

    #[test]
    fn pagination_errcode_overrides_kind() {
        let error = Error::BadPagination("query parameter 'dir' must be 'b' or 'f'");
        let response = error.to_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn interrupt_is_distinguished() {
        assert!(Error::Interrupted.is_interrupt());
        assert!(!Error::TooDeep.is_interrupt());
    }
}
