//! Typed entry-point requests. Boundary layers deserialize into these and
//! call `validate` before anything reaches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DoclinkError, Result};
use crate::model::{ChunkInput, DomainId, FileId, Scope, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub user_id: UserId,
    pub domain_id: DomainId,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    pub query_embedding: Vec<f32>,
    pub max_chunks: usize,
}

impl RetrieveRequest {
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        require_id("user_id", self.user_id.is_blank())?;
        require_id("domain_id", self.domain_id.is_blank())?;
        if self.file_ids.iter().any(FileId::is_blank) {
            return Err(DoclinkError::invalid("file_ids must not contain blank ids"));
        }
        if self.max_chunks == 0 {
            return Err(DoclinkError::invalid("max_chunks must be at least 1"));
        }
        check_embedding(&self.query_embedding, dimensions, "query_embedding")
    }

    pub fn scope(&self) -> Scope {
        Scope::domain(self.user_id.clone(), self.domain_id.clone())
            .with_files(self.file_ids.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub user_id: UserId,
    pub domain_id: DomainId,
    /// Supplied on re-ingestion; a new id is generated otherwise.
    #[serde(default)]
    pub file_id: Option<FileId>,
    pub file_name: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    pub chunks: Vec<ChunkInput>,
}

impl IngestRequest {
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        require_id("user_id", self.user_id.is_blank())?;
        require_id("domain_id", self.domain_id.is_blank())?;
        if self.file_id.as_ref().is_some_and(FileId::is_blank) {
            return Err(DoclinkError::invalid("file_id must not be blank"));
        }
        if self.file_name.trim().is_empty() {
            return Err(DoclinkError::invalid("file_name must not be empty"));
        }
        for (idx, chunk) in self.chunks.iter().enumerate() {
            if chunk.sentence.is_empty() {
                return Err(DoclinkError::invalid(format!("chunk {idx} has empty text")));
            }
            if chunk.page_number == 0 {
                return Err(DoclinkError::invalid(format!(
                    "chunk {idx} has page_number 0; pages start at 1"
                )));
            }
            check_embedding(&chunk.embedding, dimensions, &format!("chunk {idx} embedding"))?;
        }
        Ok(())
    }
}

fn require_id(field: &str, blank: bool) -> Result<()> {
    if blank {
        return Err(DoclinkError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn check_embedding(vector: &[f32], dimensions: usize, what: &str) -> Result<()> {
    if vector.len() != dimensions {
        return Err(DoclinkError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }
    if let Some(idx) = vector.iter().position(|v| !v.is_finite()) {
        return Err(DoclinkError::invalid(format!(
            "{what} component {idx} is not finite"
        )));
    }
    Ok(())
}
