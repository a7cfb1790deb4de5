use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Key generation failed")]
    KeyGenerationFailed,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Incomplete payload: missing token or encrypted field")]
    IncompletePayload,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("This route requires an encrypted request body")]
    EncryptionRequired,

    #[error("Request origin is not allowed")]
    ForbiddenOrigin,

    #[error("The HTTP server does not support connection hijacking")]
    HijackNotSupported,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Upstream timed out: {0}")]
    GatewayTimeout(String),

    #[error("Not found")]
    NotFound,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::KeyGenerationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            GatewayError::IncompletePayload => StatusCode::BAD_REQUEST,
            GatewayError::InvalidToken => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidSession => StatusCode::UNAUTHORIZED,
            GatewayError::DecryptionFailed => StatusCode::BAD_REQUEST,
            GatewayError::EncryptionRequired => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::ForbiddenOrigin => StatusCode::FORBIDDEN,
            GatewayError::HijackNotSupported => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            GatewayError::KeyGenerationFailed => "KEY_GENERATION_FAILED",
            GatewayError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            GatewayError::IncompletePayload => "INCOMPLETE_PAYLOAD",
            GatewayError::InvalidToken => "INVALID_TOKEN",
            GatewayError::InvalidSession => "INVALID_SESSION",
            GatewayError::DecryptionFailed => "DECRYPTION_FAILED",
            GatewayError::EncryptionRequired => "ENCRYPTION_REQUIRED",
            GatewayError::ForbiddenOrigin => "FORBIDDEN_ORIGIN",
            GatewayError::HijackNotSupported => "HIJACK_NOT_SUPPORTED",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::BadGateway(_) => "BAD_GATEWAY",
            GatewayError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            GatewayError::NotFound => "NOT_FOUND",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_classes() {
        assert_eq!(
            GatewayError::EncryptionRequired.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            GatewayError::InvalidToken.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::GatewayTimeout("deadline".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::BadGateway("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(GatewayError::DecryptionFailed.error_code(), "DECRYPTION_FAILED");
        assert_eq!(GatewayError::HijackNotSupported.error_code(), "HIJACK_NOT_SUPPORTED");
        assert_eq!(GatewayError::KeyGenerationFailed.error_code(), "KEY_GENERATION_FAILED");
    }
}
