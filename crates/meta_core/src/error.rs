use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("malformed value: {message}")]
    MalformedValue { message: String },
    #[error("conflicting write: {message}")]
    ConflictingWrite { message: String },
    #[error("backing store unavailable: {message}")]
    BackingStoreUnavailable { message: String },
    #[error("invalid parent: {message}")]
    InvalidParent { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl MetaError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedValue {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::ConflictingWrite {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackingStoreUnavailable {
            message: message.into(),
        }
    }

    pub fn invalid_parent(message: impl Into<String>) -> Self {
        Self::InvalidParent {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Only transport and transaction failures are worth retrying; every other kind
    /// describes the request or the stored data and will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackingStoreUnavailable { .. })
    }
}

pub type MetaResult<T> = Result<T, MetaError>;

impl From<sea_orm::DbErr> for MetaError {
    fn from(value: sea_orm::DbErr) -> Self {
        MetaError::unavailable(value.to_string())
    }
}
