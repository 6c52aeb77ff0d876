mod assembler;
mod cancel;
pub mod codec;
mod config;
pub mod crypto;
mod error;
mod model;
mod request;
mod similarity;
mod store;

pub use assembler::{
    AssemblyConfig, BudgetUnit, ContextAssembler, ContextEntry, Retrieval, SkipReason,
    SkippedChunk,
};
pub use cancel::CancelToken;
pub use codec::{decode_embedding, encode_embedding, SealedText};
pub use config::{DoclinkConfig, DEFAULT_CONFIG, DEFAULT_EMBEDDING_DIMENSIONS};
pub use crypto::{CryptoVault, DeterministicKeyStore, FileKey, KeyStore};
pub use error::{DoclinkError, Result};
pub use model::{
    normalize_domain_name, Candidate, ChunkId, ChunkInput, ChunkMeta, DomainId, DomainSummary,
    FileId, FileRecord, FileSummary, PlanTier, Scope, SealedChunk, StoredText, Usage, UserId,
    MAX_DOMAIN_NAME_CHARS,
};
pub use request::{IngestRequest, RetrieveRequest};
pub use similarity::{cosine_similarity, RankedChunk, SimilarityEngine, DEFAULT_SHARD_SIZE};
pub use store::ChunkStore;
