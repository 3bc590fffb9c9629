use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flags::flag_store::StoreError;

/// Body returned for every error: `{"message": ..., "statusCode": ...}`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    pub status_code: u16,
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("Feature flag '{0}' not found")]
    FlagNotFound(String),
    #[error("Feature flag '{0}' already exists")]
    FlagAlreadyExists(String),
    #[error("Invalid flag key '{0}': only lowercase letters, digits, '-' and '_' are allowed")]
    InvalidKey(String),
    #[error("Invalid percentage {0}: must be between 0 and 100")]
    InvalidPercentage(u8),
    #[error("Flag key '{0}' is reserved")]
    ReservedKey(String),
    #[error("Flag name must not be empty")]
    InvalidName,
    #[error("Flag key '{0}' cannot be changed")]
    ImmutableKey(String),
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("Authentication required")]
    Unauthenticated,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("flag store unavailable")]
    StoreUnavailable(String),
    #[error("Timed out while fetching data")]
    TimeoutError,
    #[error("Database error: {0}")]
    DatabaseError(sqlx::Error),
    #[error("Failed to parse data: {0}")]
    DataParsingError(String),
}

impl FlagError {
    /// Returns (error_code, status_code) for this error.
    fn error_metadata(&self) -> (&'static str, StatusCode) {
        match self {
            FlagError::FlagNotFound(_) => ("flag_not_found", StatusCode::NOT_FOUND),
            FlagError::FlagAlreadyExists(_) => ("flag_already_exists", StatusCode::CONFLICT),

            FlagError::InvalidKey(_) => ("invalid_key", StatusCode::BAD_REQUEST),
            FlagError::InvalidPercentage(_) => ("invalid_percentage", StatusCode::BAD_REQUEST),
            FlagError::ReservedKey(_) => ("reserved_key", StatusCode::BAD_REQUEST),
            FlagError::InvalidName => ("invalid_name", StatusCode::BAD_REQUEST),
            FlagError::ImmutableKey(_) => ("immutable_key", StatusCode::BAD_REQUEST),
            FlagError::RequestDecodingError(_) => {
                ("request_decoding_error", StatusCode::BAD_REQUEST)
            }
            FlagError::RequestParsingError(_) => ("request_parsing_error", StatusCode::BAD_REQUEST),

            FlagError::Unauthenticated => ("unauthenticated", StatusCode::UNAUTHORIZED),
            FlagError::Forbidden(_) => ("forbidden", StatusCode::FORBIDDEN),

            FlagError::DatabaseError(_) => ("database_error", StatusCode::INTERNAL_SERVER_ERROR),
            FlagError::DataParsingError(_) => {
                ("data_parsing_error", StatusCode::INTERNAL_SERVER_ERROR)
            }

            FlagError::StoreUnavailable(_) => {
                ("store_unavailable", StatusCode::SERVICE_UNAVAILABLE)
            }
            FlagError::TimeoutError => ("timeout", StatusCode::SERVICE_UNAVAILABLE),
        }
    }

    /// Returns a short error code for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        self.error_metadata().0
    }

    pub fn status_code(&self) -> StatusCode {
        self.error_metadata().1
    }

    pub fn is_5xx(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internals stay in the logs, clients get a generic message.
        let message = if self.is_5xx() {
            tracing::error!(error_code = self.error_code(), "{}", self);
            match self {
                FlagError::StoreUnavailable(_) | FlagError::TimeoutError => {
                    "Feature flag storage is currently unavailable. Please try again later."
                        .to_string()
                }
                _ => "An internal server error occurred. Please try again later.".to_string(),
            }
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                message,
                status_code: status.as_u16(),
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for FlagError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateKey(key) => FlagError::FlagAlreadyExists(key),
            StoreError::Unavailable(reason) => FlagError::StoreUnavailable(reason),
            StoreError::Timeout => FlagError::TimeoutError,
            StoreError::Corrupted(reason) => FlagError::DataParsingError(reason),
            StoreError::Database(sqlx::Error::PoolTimedOut) => FlagError::TimeoutError,
            StoreError::Database(
                err @ (sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_)),
            ) => FlagError::StoreUnavailable(err.to_string()),
            StoreError::Database(err) => FlagError::DatabaseError(err),
        }
    }
}
