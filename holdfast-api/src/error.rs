use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use holdfast_order::{EscrowError, StoreError};
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    InvalidSignature,
    UpstreamError(String),
    InternalServerError(String),
    Anyhow(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::InvalidSignature => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::UpstreamError(msg) => {
                tracing::warn!("Payment provider failure: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<EscrowError> for AppError {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::Validation(_) | EscrowError::PreconditionNotMet(_) => AppError::ValidationError(err.to_string()),
            EscrowError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            EscrowError::AlreadyDone(_)
            | EscrowError::AlreadyMet(_)
            | EscrowError::AlreadyDisputed(_)
            | EscrowError::Store(StoreError::Conflict { .. }) => AppError::ConflictError(err.to_string()),
            EscrowError::InvalidSignature => AppError::InvalidSignature,
            EscrowError::ProviderFailure(_) => AppError::UpstreamError(err.to_string()),
            EscrowError::DataInconsistency(_) | EscrowError::Store(_) => AppError::InternalServerError(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status(err: EscrowError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_escrow_errors_map_to_statuses() {
        assert_eq!(status(EscrowError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(EscrowError::PreconditionNotMet("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(EscrowError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(EscrowError::AlreadyMet(Uuid::new_v4())), StatusCode::CONFLICT);
        assert_eq!(status(EscrowError::InvalidSignature), StatusCode::UNAUTHORIZED);
        assert_eq!(status(EscrowError::ProviderFailure("down".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status(EscrowError::Store(StoreError::Conflict { id: Uuid::new_v4(), expected: 1, found: 2 })),
            StatusCode::CONFLICT
        );
        assert_eq!(status(EscrowError::DataInconsistency("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
