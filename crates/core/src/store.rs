//! Storage seam between the retrieval core and its system of record.
//!
//! Embeddings live behind this trait as opaque encoded blobs, so a backend
//! can swap the brute-force scan for an indexed structure without touching
//! ranking or assembly.

use crate::error::Result;
use crate::model::{
    Candidate, ChunkId, DomainId, DomainSummary, FileId, FileRecord, FileSummary, PlanTier,
    SealedChunk, Scope, StoredText, Usage, UserId,
};

pub trait ChunkStore: Send + Sync {
    /// Writes a file's chunks in one transaction, replacing whatever the
    /// file held before. Readers see all of the new chunks or none.
    fn put_chunks(&self, file: &FileRecord, chunks: &[SealedChunk]) -> Result<usize>;

    /// Embeddings and metadata for every chunk in scope. Fails with
    /// `ScopeViolation` when the domain is not owned by the user.
    fn get_candidates(&self, scope: &Scope) -> Result<Vec<Candidate>>;

    fn get_chunk_text(&self, chunk_id: ChunkId) -> Result<StoredText>;

    /// Returns whether anything was removed. Absent ids are a no-op.
    fn delete_file(&self, file_id: &FileId) -> Result<bool>;

    /// Removes the domain with its files and chunks. Returns the ids of the
    /// files that went with it.
    fn delete_domain(&self, domain_id: &DomainId) -> Result<Vec<FileId>>;

    fn ensure_user(&self, user_id: &UserId, tier: PlanTier) -> Result<()>;

    fn create_domain(
        &self,
        user_id: &UserId,
        name: &str,
        domain_id: Option<DomainId>,
    ) -> Result<DomainId>;

    fn rename_domain(&self, user_id: &UserId, domain_id: &DomainId, name: &str) -> Result<()>;

    fn list_domains(&self, user_id: &UserId) -> Result<Vec<DomainSummary>>;

    fn list_files(&self, user_id: &UserId, domain_id: &DomainId) -> Result<Vec<FileSummary>>;

    fn domain_owner(&self, domain_id: &DomainId) -> Result<Option<UserId>>;

    fn file_owner(&self, file_id: &FileId) -> Result<Option<(UserId, DomainId)>>;

    fn usage(&self, user_id: &UserId) -> Result<Usage>;
}
