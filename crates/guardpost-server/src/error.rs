use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use guardpost_shared::ValidationError;
use guardpost_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid credentials")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Attachment exceeds the {max} byte limit")]
    PayloadTooLarge { max: usize },

    #[error("Temporarily unavailable: {0}")]
    TransientIo(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("Conversation not found".into()),
            StoreError::NotParticipant => {
                ServerError::Forbidden("Not a participant of this conversation".into())
            }
            StoreError::Validation(e) => ServerError::Validation(e),
            other if other.is_transient() => ServerError::TransientIo(other.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Validation(_) | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Server-side failures are logged here
    /// and replaced with a generic text.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::TransientIo(detail) => {
                tracing::warn!(error = %detail, "Transient I/O failure");
                "Storage temporarily unavailable".to_string()
            }
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.client_message(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
