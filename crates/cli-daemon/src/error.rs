//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use daemon::PipelineError;
use log::error;
use serde::Serialize;

/// Body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    Upload { status: StatusCode, message: String },

    #[error("Daily conversion limit of {0} reached. Please try again tomorrow.")]
    QuotaExceeded(u32),

    #[error("File not found")]
    NotFound,

    #[error("Not allowed by CORS")]
    OriginNotAllowed,

    #[error("Conversion failed")]
    ConversionFailed,

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upload { status, .. } => *status,
            Self::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::ConversionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnsupportedMediaType(mime) => {
                Self::BadRequest(format!("Only video files are allowed, got {}", mime))
            }
            PipelineError::QuotaExceeded { limit } => Self::QuotaExceeded(limit),
            // Engine details were logged by the runner
            PipelineError::Conversion(_) => Self::ConversionFailed,
            other => {
                error!("Conversion request failed: {}", other);
                Self::Internal
            }
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::Upload {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
