use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),
    #[error("VALIDATION_ERROR: BATCH_SIZE_LIMIT_EXCEEDED: batch has {count} operations, limit is {limit}")]
    BatchSizeLimitExceeded { count: usize, limit: usize },
    #[error("INVALID_UNDO_TOKEN: undo token is invalid or has expired")]
    InvalidUndoToken,
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::BatchSizeLimitExceeded { .. } => "VALIDATION_ERROR",
            Self::InvalidUndoToken => "INVALID_UNDO_TOKEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Io(_) => "IO_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::BatchSizeLimitExceeded { .. } | Self::InvalidUndoToken => 400,
            Self::NotFound(_) => 404,
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }

    /// Human-readable message without the leading code.
    pub fn message(&self) -> String {
        let rendered = self.to_string();
        let prefix = format!("{}: ", self.code());
        rendered
            .strip_prefix(&prefix)
            .map(ToString::to_string)
            .unwrap_or(rendered)
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::BatchSizeLimitExceeded { count, limit } => Some(json!({
                "reason": "BATCH_SIZE_LIMIT_EXCEEDED",
                "count": count,
                "limit": limit
            })),
            _ => None,
        }
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{} '{}' not found", entity, id))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn batch_limit_reports_validation_code_with_reason() {
        let error = AppError::BatchSizeLimitExceeded { count: 101, limit: 100 };
        assert_eq!(error.code(), "VALIDATION_ERROR");
        assert_eq!(error.status(), 400);
        let details = error.details().expect("details");
        assert_eq!(details["reason"], "BATCH_SIZE_LIMIT_EXCEEDED");
        assert!(error.message().starts_with("BATCH_SIZE_LIMIT_EXCEEDED"));
    }

    #[test]
    fn invalid_token_message_is_generic() {
        let error = AppError::InvalidUndoToken;
        assert_eq!(error.code(), "INVALID_UNDO_TOKEN");
        assert_eq!(error.message(), "undo token is invalid or has expired");
    }
}
