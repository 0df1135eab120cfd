use thiserror::Error;

/// §4.1 contract: `NotFound`, `Duplicate`, `Integrity`, `BadVersion`, `Internal(msg)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("unsupported schema/record version: {0}")]
    BadVersion(String),

    #[error("internal store error: {0}")]
    Internal(String),

    #[error("vault is locked — unlock before any read/write")]
    VaultLocked,

    #[error("crypto error: {0}")]
    Crypto(#[from] agent_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::Duplicate(db_err.message().to_string())
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Internal(format!("migration failed: {e}"))
    }
}
