use thiserror::Error;

use outlay_core::approvals::StoreError;

pub mod approval;

pub use approval::SqlApprovalStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Store(error) => error,
            other => StoreError::Backend(other.to_string()),
        }
    }
}
