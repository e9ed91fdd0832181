use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::NaiveDate;
use thiserror::Error;

use crate::types::Side;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limiter deadline of {0:?} exceeded")]
    RateLimitTimeout(std::time::Duration),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("CSV parse error: {0}")]
    Parse(String),

    #[error("No snapshot for {category} on {date}")]
    NotFound { category: String, date: String },

    #[error("Member {member_id} not present in {side} snapshot ({date})")]
    MemberNotFound {
        member_id: i64,
        side: Side,
        date: NaiveDate,
    },

    #[error("Member {member_id} is unrated in the {date} snapshot")]
    MemberUnrated { member_id: i64, date: NaiveDate },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unsupported category: {0}")]
    UnknownCategory(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn not_found(category: impl ToString, date: impl ToString) -> Self {
        AppError::NotFound {
            category: category.to_string(),
            date: date.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound { .. }
            | AppError::MemberNotFound { .. }
            | AppError::MemberUnrated { .. } => StatusCode::NOT_FOUND,
            AppError::InvalidRange(_)
            | AppError::InvalidQuery(_)
            | AppError::UnknownCategory(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Auth(_) | AppError::Upstream(_) | AppError::Parse(_) | AppError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::RateLimitTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
