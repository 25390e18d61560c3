//! Error taxonomy shared by the HTTP routes, the websocket handshake and the
//! token-keyed brokers.
//!
//! | Variant                  | HTTP | WS close | Notes                               |
//! |--------------------------|------|----------|-------------------------------------|
//! | `InvalidToken`           | 400  | 3000     | unknown/expired session or upload   |
//! | `TokenInUse`             | 409  | -        | token already registered            |
//! | `MalformedRequest`       | 422  | -        | mismatched upload arrays, bad sizes |
//! | `NavigationFailed`       | 500  | 1011     | session never registered            |
//! | `ResourceVanished`       | 404  | -        | not logged as an error              |
//! | `UpstreamHandlerFailure` | 500  | -        | user hook failed, logged + dropped  |
//! | `UploadExpired`          | 410  | -        | waiter side of an evicted upload    |
//! | `NoFileSelected`         | 400  | -        | file chooser got nothing usable     |
//! | `SessionClosed`          | 410  | -        | operation on a closed session       |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Close code sent to clients presenting an unknown session token.
pub const CLOSE_INVALID_TOKEN: u16 = 3000;

/// Close code sent when the admission gate stayed closed past the wait limit.
pub const CLOSE_NOT_ACCEPTING: u16 = 3001;

/// Close code the client sends when it navigates away on purpose.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token is already registered")]
    TokenInUse,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Navigation to initial page `{0}` has failed")]
    NavigationFailed(String),

    #[error("Resource no longer available")]
    ResourceVanished,

    #[error("Handler `{0}` failed")]
    UpstreamHandlerFailure(String),

    #[error("Upload expired before it was completed")]
    UploadExpired,

    #[error("No file was selected")]
    NoFileSelected,

    #[error("Session is closed")]
    SessionClosed,
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidToken | Self::NoFileSelected => StatusCode::BAD_REQUEST,
            Self::TokenInUse => StatusCode::CONFLICT,
            Self::MalformedRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ResourceVanished => StatusCode::NOT_FOUND,
            Self::UploadExpired | Self::SessionClosed => StatusCode::GONE,
            Self::NavigationFailed(_) | Self::UpstreamHandlerFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenInUse => "TOKEN_IN_USE",
            Self::MalformedRequest(_) => "MALFORMED_REQUEST",
            Self::NavigationFailed(_) => "NAVIGATION_FAILED",
            Self::ResourceVanished => "NOT_FOUND",
            Self::UpstreamHandlerFailure(_) => "HANDLER_FAILED",
            Self::UploadExpired => "UPLOAD_EXPIRED",
            Self::NoFileSelected => "NO_FILE_SELECTED",
            Self::SessionClosed => "SESSION_CLOSED",
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_server_errors() {
        assert_eq!(GateError::InvalidToken.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GateError::MalformedRequest("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(GateError::ResourceVanished.status(), StatusCode::NOT_FOUND);
        assert!(GateError::NavigationFailed("/".into())
            .status()
            .is_server_error());
    }

    #[test]
    fn navigation_message_names_the_url() {
        let err = GateError::NavigationFailed("http://h/a".into());
        assert!(err.to_string().contains("`http://h/a`"));
    }
}
