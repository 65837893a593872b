use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] bson::ser::Error),

    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
