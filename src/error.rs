use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Withdrawal error: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Step-up authentication required for action: {action}")]
    StepUpRequired { action: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Escrow state machine errors
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Invalid state transition: charge is {current}, operation requires {requested}")]
    InvalidStateTransition { current: String, requested: String },

    /// The one-held-charge-per-task invariant failed. Always logged as a
    /// security event and never auto-healed.
    #[error("Escrow integrity violation on task {task_id}: {held_count} held charges")]
    IntegrityViolation { task_id: Uuid, held_count: i64 },

    #[error("Transaction {id} is a {actual}, expected a charge")]
    NotACharge { id: Uuid, actual: String },

    #[error("Task {task_id} already has milestones defined")]
    MilestonesAlreadyDefined { task_id: Uuid },

    #[error("Milestone total {total} exceeds agreed price {agreed_price}")]
    MilestoneTotalExceedsPrice { total: String, agreed_price: String },

    #[error("Task is not in a state that accepts this operation: {0}")]
    TaskNotEligible(String),
}

/// Withdrawal processor errors
#[derive(Error, Debug)]
pub enum WithdrawalError {
    #[error("Requested {requested} is below the minimum withdrawal of {minimum}")]
    BelowMinimum { requested: String, minimum: String },

    #[error("Fee {fee} leaves no positive net amount for {requested}")]
    FeeExceedsAmount { requested: String, fee: String },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: String, available: String },

    #[error("Withdrawals are blocked while {frozen} is frozen under dispute")]
    FrozenBalance { frozen: String },
}

/// Payment gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    RequestFailed(String),

    #[error("Gateway declined: {0}")]
    Declined(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed gateway event: {0}")]
    MalformedEvent(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Forbidden(why) => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                why.clone(),
                None,
            ),
            // 428 so the caller can distinguish "re-authenticate and retry
            // the identical request" from a plain authorization failure.
            AppError::StepUpRequired { action } => (
                StatusCode::PRECONDITION_REQUIRED,
                "STEP_UP_REQUIRED",
                format!("Step-up authentication required for: {}", action),
                Some(serde_json::json!({ "action": action })),
            ),
            AppError::Escrow(EscrowError::InvalidStateTransition { current, requested }) => (
                StatusCode::CONFLICT,
                "INVALID_STATE_TRANSITION",
                format!("Charge is {}, operation requires {}", current, requested),
                Some(serde_json::json!({
                    "current": current,
                    "requested": requested,
                })),
            ),
            AppError::Escrow(EscrowError::IntegrityViolation { task_id, held_count }) => (
                StatusCode::CONFLICT,
                "ESCROW_INTEGRITY_VIOLATION",
                format!(
                    "Escrow integrity violation on task {}: {} held charges",
                    task_id, held_count
                ),
                Some(serde_json::json!({
                    "task_id": task_id,
                    "held_count": held_count,
                })),
            ),
            AppError::Escrow(inner) => (
                StatusCode::BAD_REQUEST,
                "ESCROW_ERROR",
                inner.to_string(),
                None,
            ),
            AppError::Withdrawal(WithdrawalError::InsufficientBalance { requested, available }) => (
                StatusCode::BAD_REQUEST,
                "INSUFFICIENT_BALANCE",
                format!(
                    "Insufficient balance: requested {}, available {}",
                    requested, available
                ),
                Some(serde_json::json!({
                    "requested": requested,
                    "available": available,
                })),
            ),
            AppError::Withdrawal(WithdrawalError::FrozenBalance { frozen }) => (
                StatusCode::CONFLICT,
                "FROZEN_BALANCE",
                format!("Withdrawals are blocked while {} is frozen", frozen),
                Some(serde_json::json!({ "frozen": frozen })),
            ),
            AppError::Withdrawal(inner) => (
                StatusCode::BAD_REQUEST,
                "WITHDRAWAL_REJECTED",
                inner.to_string(),
                None,
            ),
            AppError::Gateway(GatewayError::InvalidSignature) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                "Webhook signature verification failed".to_string(),
                None,
            ),
            AppError::Gateway(inner) => (
                StatusCode::BAD_GATEWAY,
                "GATEWAY_FAILURE",
                inner.to_string(),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg.clone(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Gateway(GatewayError::RequestFailed(format!("{:?}", error)))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        GatewayError::RequestFailed(format!("{:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(error: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(error.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
