use crate::api::ApiResponse;
use crate::models::AttemptStatus;
use axum::{http::StatusCode, response::Json};
use tracing::{error, info, warn};

/// Centralized error types for consistent API error handling
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Attempt blocked by the continuation policy. Carries the full
    /// status payload so the caller can render countdown messaging.
    #[error("Attempt blocked: {}", .0.message)]
    PolicyDenied(AttemptStatus),

    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),
}

/// Error response body. Blocked attempts carry their status payload in
/// `data`; every other failure carries only a message.
pub type ErrorResponse = (StatusCode, Json<ApiResponse<AttemptStatus>>);

/// Error context for structured logging
#[derive(Debug)]
pub struct ErrorContext {
    pub operation: String,
    pub resource_id: Option<String>,
    pub resource_type: String,
}

impl ErrorContext {
    pub fn new(operation: &str, resource_type: &str) -> Self {
        Self {
            operation: operation.to_string(),
            resource_id: None,
            resource_type: resource_type.to_string(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }
}

impl ApiError {
    /// Convert API error to HTTP response with consistent structure and logging
    pub fn to_response_with_context(self, context: ErrorContext) -> ErrorResponse {
        match self {
            ApiError::NotFound(_) => {
                info!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Resource not found"
                );
                (
                    StatusCode::NOT_FOUND,
                    Json(ApiResponse::error(format!(
                        "{} not found",
                        context.resource_type
                    ))),
                )
            }
            ApiError::ValidationError(_) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Validation error"
                );
                (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::error(self.to_string())),
                )
            }
            ApiError::PolicyDenied(status) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    attempts_used = status.attempts_used,
                    next_attempt_available_at = ?status.next_attempt_available_at,
                    "Attempt blocked by continuation policy"
                );
                let message = status.message.clone();
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ApiResponse {
                        success: false,
                        data: Some(status),
                        error: Some(message),
                    }),
                )
            }
            ApiError::DatabaseError(_) => {
                error!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Database error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::error(
                        "Database operation failed. Please try again.".to_string(),
                    )),
                )
            }
        }
    }
}

/// Allows using `?` on database queries inside service methods.
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::DatabaseError(anyhow::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_status() -> AttemptStatus {
        AttemptStatus {
            can_attempt: false,
            attempts_remaining: 0,
            total_attempts: 3,
            attempts_used: 3,
            next_attempt_available_at: None,
            reset_at: None,
            blocked_until: None,
            message: "You've used all 3 attempts".to_string(),
        }
    }

    #[test]
    fn test_error_context_creation() {
        let context = ErrorContext::new("submit_completion", "completion").with_id("123");

        assert_eq!(context.operation, "submit_completion");
        assert_eq!(context.resource_type, "completion");
        assert_eq!(context.resource_id, Some("123".to_string()));
    }

    #[test]
    fn test_api_error_status_mapping() {
        let error = ApiError::NotFound("Quiz not found".to_string());
        let context = ErrorContext::new("get_quiz", "quiz").with_id("123");
        let (status, _response) = error.to_response_with_context(context);
        assert_eq!(status, StatusCode::NOT_FOUND);

        let error = ApiError::ValidationError("Invalid data".to_string());
        let (status, _) = error.to_response_with_context(ErrorContext::new("op", "resource"));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let error = ApiError::DatabaseError(anyhow::anyhow!("connection lost"));
        let (status, _) = error.to_response_with_context(ErrorContext::new("op", "resource"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_policy_denied_carries_status_payload() {
        let error = ApiError::PolicyDenied(blocked_status());
        let context = ErrorContext::new("submit_completion", "completion");
        let (status, Json(body)) = error.to_response_with_context(context);

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(!body.success);
        let payload = body.data.expect("blocked response keeps the status payload");
        assert!(!payload.can_attempt);
        assert_eq!(payload.attempts_used, 3);
    }
}
