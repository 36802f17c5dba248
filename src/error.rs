use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;

/// Failures the assessment engine itself can produce. Handlers convert these
/// into the HTTP envelope with the request id attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    Conflict(String),
    #[error("not enough questions available: requested {requested}, bank has {available}")]
    InsufficientBank { requested: usize, available: usize },
    #[error("{0}")]
    Validation(String),
}

impl EngineError {
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{what} not found"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientBank { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Authorization(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::InsufficientBank { .. } => "INSUFFICIENT_BANK",
            Self::Validation(_) => "VALIDATION_ERROR",
        }
    }

    pub fn into_app(self, request_id: impl Into<String>) -> AppError {
        AppError::new(self.status(), self.code(), self.to_string(), request_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_http_mapping() {
        assert_eq!(EngineError::not_found("quiz").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            EngineError::Conflict("locked".into()).status(),
            StatusCode::CONFLICT
        );
        let short = EngineError::InsufficientBank { requested: 5, available: 3 };
        assert_eq!(short.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(short.code(), "INSUFFICIENT_BANK");
        assert!(short.to_string().contains("requested 5"));
    }
}
