use std::collections::HashSet;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use doclink_core::{
    encode_embedding, CancelToken, ChunkStore, ContextAssembler, CryptoVault, DoclinkConfig,
    DoclinkError, DomainId, DomainSummary, FileId, FileRecord, FileSummary, IngestRequest,
    KeyStore, PlanTier, Result, RetrieveRequest, Retrieval, SealedChunk, SimilarityEngine,
    Usage, UserId,
};

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub file_id: FileId,
    pub chunks: usize,
}

/// Entry points over one store and one key source: scoped retrieval,
/// ingestion, deletion and folder management.
pub struct RetrievalPipeline<S, K> {
    store: S,
    vault: CryptoVault<K>,
    engine: SimilarityEngine,
    assembler: ContextAssembler,
}

impl<S: ChunkStore, K: KeyStore> RetrievalPipeline<S, K> {
    pub fn new(store: S, keys: K, config: &DoclinkConfig) -> Self {
        Self {
            store,
            vault: CryptoVault::new(keys),
            engine: SimilarityEngine::new(config.embedding_dimensions)
                .with_shard_size(config.shard_size),
            assembler: ContextAssembler::new(config.assembly()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn vault(&self) -> &CryptoVault<K> {
        &self.vault
    }

    pub fn dimensions(&self) -> usize {
        self.engine.dimensions()
    }

    pub fn retrieve(&self, request: &RetrieveRequest, cancel: &CancelToken) -> Result<Retrieval> {
        request.validate(self.dimensions())?;
        let scope = request.scope();
        let candidates = self.store.get_candidates(&scope)?;
        cancel.check()?;
        let shortlist =
            self.engine
                .rank(&request.query_embedding, &candidates, request.max_chunks, cancel)?;
        debug!(
            user_id = %scope.user_id,
            domain_id = %scope.domain_id,
            candidates = candidates.len(),
            shortlisted = shortlist.len(),
            "ranked candidates"
        );
        let retrieval = self.assembler.assemble(
            shortlist,
            |chunk_id| self.store.get_chunk_text(chunk_id),
            &self.vault,
            cancel,
        )?;
        if !retrieval.skipped.is_empty() {
            warn!(
                target: "doclink::integrity",
                skipped = retrieval.skipped.len(),
                "retrieval excluded unreadable chunks"
            );
        }
        info!(
            user_id = %scope.user_id,
            domain_id = %scope.domain_id,
            entries = retrieval.entries.len(),
            dropped_by_budget = retrieval.dropped_by_budget,
            "retrieval complete"
        );
        Ok(retrieval)
    }

    pub fn ingest_file(&self, request: &IngestRequest) -> Result<IngestReport> {
        request.validate(self.dimensions())?;
        self.require_domain(&request.user_id, &request.domain_id)?;
        let file_id = request
            .file_id
            .clone()
            .unwrap_or_else(|| FileId::new(Uuid::new_v4().to_string()));
        let existing = self.store.file_owner(&file_id)?;
        if let Some((owner, domain)) = &existing {
            if owner != &request.user_id || domain != &request.domain_id {
                return Err(DoclinkError::scope(format!(
                    "file {file_id} belongs to another domain"
                )));
            }
        }
        self.vault.keys().provision_file_key(&file_id)?;
        match self.seal_and_store(request, &file_id) {
            Ok(chunks) => Ok(IngestReport { file_id, chunks }),
            Err(err) => {
                // A key minted for a brand-new file has nothing else sealed
                // under it.
                if existing.is_none() {
                    if let Err(cleanup) = self.vault.keys().forget_file_key(&file_id) {
                        warn!(
                            file_id = %file_id,
                            error = %cleanup,
                            "orphaned data key left behind"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    fn seal_and_store(&self, request: &IngestRequest, file_id: &FileId) -> Result<usize> {
        let sealed = request
            .chunks
            .par_iter()
            .enumerate()
            .map(|(ordinal, chunk)| {
                Ok(SealedChunk {
                    ordinal: ordinal as u32,
                    page_number: chunk.page_number,
                    is_header: chunk.is_header,
                    is_table: chunk.is_table,
                    embedding: encode_embedding(&chunk.embedding),
                    sealed: self.vault.encrypt(file_id, &chunk.sentence)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut nonces = HashSet::with_capacity(sealed.len());
        if !sealed.iter().all(|chunk| nonces.insert(chunk.sealed.nonce)) {
            return Err(DoclinkError::Crypto(format!(
                "nonce collision while sealing file {file_id}"
            )));
        }

        let record = FileRecord {
            file_id: file_id.clone(),
            domain_id: request.domain_id.clone(),
            user_id: request.user_id.clone(),
            file_name: request.file_name.clone(),
            modified_at: request.modified_at,
        };
        self.store.put_chunks(&record, &sealed)
    }

    /// Removes a file and its chunks, then its data key. Deleting an unknown
    /// file is a no-op.
    pub fn delete_file(&self, user_id: &UserId, file_id: &FileId) -> Result<bool> {
        match self.store.file_owner(file_id)? {
            None => Ok(false),
            Some((owner, _)) if &owner != user_id => Err(DoclinkError::scope(format!(
                "file {file_id} is not owned by user {user_id}"
            ))),
            Some(_) => {
                let deleted = self.store.delete_file(file_id)?;
                self.vault.keys().forget_file_key(file_id)?;
                Ok(deleted)
            }
        }
    }

    pub fn delete_domain(&self, user_id: &UserId, domain_id: &DomainId) -> Result<Vec<FileId>> {
        match self.store.domain_owner(domain_id)? {
            None => Ok(Vec::new()),
            Some(owner) if &owner != user_id => Err(DoclinkError::scope(format!(
                "domain {domain_id} is not owned by user {user_id}"
            ))),
            Some(_) => {
                let files = self.store.delete_domain(domain_id)?;
                for file_id in &files {
                    self.vault.keys().forget_file_key(file_id)?;
                }
                Ok(files)
            }
        }
    }

    pub fn ensure_user(&self, user_id: &UserId, tier: PlanTier) -> Result<()> {
        if user_id.is_blank() {
            return Err(DoclinkError::invalid("user_id must not be empty"));
        }
        self.store.ensure_user(user_id, tier)
    }

    pub fn create_domain(
        &self,
        user_id: &UserId,
        name: &str,
        domain_id: Option<DomainId>,
    ) -> Result<DomainId> {
        if user_id.is_blank() {
            return Err(DoclinkError::invalid("user_id must not be empty"));
        }
        self.store.create_domain(user_id, name, domain_id)
    }

    pub fn rename_domain(&self, user_id: &UserId, domain_id: &DomainId, name: &str) -> Result<()> {
        self.store.rename_domain(user_id, domain_id, name)
    }

    pub fn list_domains(&self, user_id: &UserId) -> Result<Vec<DomainSummary>> {
        self.store.list_domains(user_id)
    }

    pub fn list_files(&self, user_id: &UserId, domain_id: &DomainId) -> Result<Vec<FileSummary>> {
        self.store.list_files(user_id, domain_id)
    }

    pub fn usage(&self, user_id: &UserId) -> Result<Usage> {
        self.store.usage(user_id)
    }

    fn require_domain(&self, user_id: &UserId, domain_id: &DomainId) -> Result<()> {
        match self.store.domain_owner(domain_id)? {
            Some(owner) if &owner == user_id => Ok(()),
            _ => Err(DoclinkError::scope(format!(
                "domain {domain_id} is not owned by user {user_id}"
            ))),
        }
    }
}
