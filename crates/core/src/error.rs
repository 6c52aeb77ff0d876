use thiserror::Error;

use crate::model::ChunkId;

#[derive(Error, Debug)]
pub enum DoclinkError {
    #[error("scope violation: {0}")]
    ScopeViolation(String),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("authentication failure for chunk text of file {file_id}")]
    AuthenticationFailure { file_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, DoclinkError>;

impl DoclinkError {
    pub fn scope(message: impl Into<String>) -> Self {
        Self::ScopeViolation(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn chunk_not_found(chunk_id: ChunkId) -> Self {
        Self::NotFound(format!("chunk {chunk_id}"))
    }

    /// Errors that only invalidate a single stored chunk. Retrieval drops
    /// the chunk and keeps going.
    pub fn is_per_chunk(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord(_) | Self::AuthenticationFailure { .. }
        )
    }
}

impl From<anyhow::Error> for DoclinkError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<DoclinkError>() {
            Ok(typed) => typed,
            Err(other) => Self::Storage(format!("{other:#}")),
        }
    }
}
