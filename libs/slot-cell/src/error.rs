use thiserror::Error;
use tracing::warn;

use shared_database::supabase::is_conflict;
use shared_models::error::AppError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Held by another session, or lost the race to another booking.
    #[error("Slot unavailable: {0}")]
    SlotUnavailable(String),

    /// The slot backs a booking and cannot be edited or deleted.
    #[error("Slot is booked: {0}")]
    SlotBooked(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SlotError {
    pub fn slot_not_found(slot_id: impl std::fmt::Display) -> Self {
        SlotError::NotFound(format!("time slot {} not found", slot_id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SlotError::NotFound(_))
    }
}

impl From<anyhow::Error> for SlotError {
    fn from(err: anyhow::Error) -> Self {
        if is_conflict(&err) {
            SlotError::Constraint(err.to_string())
        } else {
            SlotError::Storage(err.to_string())
        }
    }
}

impl From<redis::RedisError> for SlotError {
    fn from(err: redis::RedisError) -> Self {
        SlotError::Storage(format!("redis: {}", err))
    }
}

impl From<deadpool_redis::PoolError> for SlotError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        SlotError::Storage(format!("redis pool: {}", err))
    }
}

impl From<serde_json::Error> for SlotError {
    fn from(err: serde_json::Error) -> Self {
        SlotError::Storage(format!("malformed record: {}", err))
    }
}

impl From<SlotError> for AppError {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::Validation(msg) => AppError::ValidationError(msg),
            SlotError::Forbidden(msg) => AppError::Forbidden(msg),
            SlotError::NotFound(msg) => AppError::NotFound(msg),
            SlotError::SlotUnavailable(msg) => AppError::SlotUnavailable(msg),
            SlotError::SlotBooked(msg) => AppError::Conflict(msg),
            SlotError::Constraint(msg) => AppError::Conflict(msg),
            SlotError::Storage(msg) => {
                warn!("Slot storage failure: {}", msg);
                AppError::Database(msg)
            }
        }
    }
}
