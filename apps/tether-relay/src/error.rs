use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tether_core::{FrameError, TokenError};
use thiserror::Error;

/// Failures surfaced by the relay's connection and session management.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("token has expired")]
    AuthExpired,
    #[error("invalid token: {0}")]
    AuthInvalid(String),
    #[error("missing bearer credential")]
    MissingCredentials,
    #[error("address {0} is not permitted")]
    AddressRejected(std::net::IpAddr),
    #[error("too many requests")]
    RateLimited,
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} is already registered")]
    DuplicateId(String),
    #[error("transport error on session {0}")]
    TransportError(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TokenError> for RelayError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => RelayError::AuthExpired,
            TokenError::Invalid(reason) => RelayError::AuthInvalid(reason),
        }
    }
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::AuthExpired | RelayError::AuthInvalid(_) => StatusCode::FORBIDDEN,
            RelayError::MissingCredentials => StatusCode::UNAUTHORIZED,
            RelayError::AddressRejected(_) => StatusCode::FORBIDDEN,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            RelayError::DuplicateId(_) | RelayError::TransportError(_) | RelayError::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable label used in metrics and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::AuthExpired => "auth_expired",
            RelayError::AuthInvalid(_) => "auth_invalid",
            RelayError::MissingCredentials => "missing_credentials",
            RelayError::AddressRejected(_) => "address_rejected",
            RelayError::RateLimited => "rate_limited",
            RelayError::NotFound(_) => "not_found",
            RelayError::DuplicateId(_) => "duplicate_id",
            RelayError::TransportError(_) => "transport_error",
            RelayError::MalformedFrame(_) => "malformed_frame",
            RelayError::Encode(_) => "encode_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = if status.is_server_error() {
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(json!({ "detail": detail, "error_type": self.kind() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn token_errors_map_to_auth_kinds() {
        assert!(matches!(
            RelayError::from(TokenError::Expired),
            RelayError::AuthExpired
        ));
        let invalid = RelayError::from(TokenError::Invalid("bad signature".into()));
        assert_eq!(invalid.kind(), "auth_invalid");
        assert_eq!(invalid.status(), StatusCode::FORBIDDEN);
    }

    #[test_timeout::timeout]
    fn frame_errors_are_malformed_frames() {
        let err = RelayError::from(FrameError::MissingTarget);
        assert_eq!(err.kind(), "malformed_frame");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test_timeout::timeout]
    fn statuses_follow_taxonomy() {
        assert_eq!(RelayError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            RelayError::MissingCredentials.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RelayError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::DuplicateId("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
