use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::core::aliases::DieselError;

/// Standard success envelope returned by every handler.
#[derive(Serialize, ToSchema)]
pub struct StdResponse<T, M> {
    pub data: Option<T>,
    pub message: Option<M>,
}

impl<T: Serialize, M: Serialize> IntoResponse for StdResponse<T, M> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Error taxonomy for the booking core.
///
/// Guard violations and input errors are returned synchronously and never
/// retried here; idempotent convergence cases are not errors at all and do
/// not appear in this enum.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("resource not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0} is unreachable")]
    ServiceUnreachable(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DieselError> for AppError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => AppError::NotFound,
            other => AppError::Other(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ServiceUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }

        let body = StdResponse::<(), String> {
            data: None,
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err: AppError = DieselError::NotFound.into();
        assert!(matches!(err, AppError::NotFound));
    }

    #[test]
    fn status_codes_follow_the_taxonomy() {
        let cases = [
            (AppError::NotFound, StatusCode::NOT_FOUND),
            (
                AppError::Forbidden("nope".into()),
                StatusCode::FORBIDDEN,
            ),
            (AppError::Conflict("raced".into()), StatusCode::CONFLICT),
            (
                AppError::BadRequest("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::InvalidState("deposit already paid".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AppError::ServiceUnreachable("CapacityLedger".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Upstream("card declined".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
