use thiserror::Error;

use crate::db::StoreError;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Errors returned by the entitlement services.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        ServiceError::InvalidTransition(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ServiceError::Conflict(message.into())
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::InvalidTransition(_) => "invalid_transition",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::PlanNotFound(_) => "plan_not_found",
            ServiceError::Storage(_) => "storage_error",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Conflict(_))
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(message) => ServiceError::Conflict(message),
            StoreError::Overflow(category) => {
                ServiceError::Validation(format!("Usage counter '{}' would overflow", category))
            }
            StoreError::Backend(message) => {
                log::error!("Storage failure: {}", message);
                ServiceError::Storage(message)
            }
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServiceError::Validation(errors.to_string())
    }
}
