//! PostgreSQL adapters for the approval workflow

pub mod database;

pub use database::{
    directory::PgDirectory,
    migrations::run_migrations,
    pool::{create_pool, ping},
    store::PgApprovalStore,
};
pub use sqlx::PgPool;

use diwan_core::RequestId;
use diwan_workflow::{IdentityError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid stored value: {0}")]
    Decode(String),

    #[error("Version conflict on request {request_id}: expected {expected}, found {actual}")]
    VersionConflict {
        request_id: RequestId,
        expected: u64,
        actual: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, InfraError>;

impl From<InfraError> for StoreError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::VersionConflict {
                request_id,
                expected,
                actual,
            } => StoreError::Conflict {
                request_id,
                expected,
                actual,
            },
            InfraError::NotFound(what) => StoreError::NotFound(what),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<InfraError> for IdentityError {
    fn from(err: InfraError) -> Self {
        IdentityError::Backend(err.to_string())
    }
}
