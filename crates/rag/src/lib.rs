pub mod keys;
pub mod pipeline;
mod schema;
pub mod store;

use doclink_core::{DoclinkConfig, DoclinkError, Result};

pub use keys::{load_identity, write_identity, SqliteKeyStore};
pub use pipeline::{IngestReport, RetrievalPipeline};
pub use store::SqliteChunkStore;

pub type SqlitePipeline = RetrievalPipeline<SqliteChunkStore, SqliteKeyStore>;

/// Opens the SQLite store and key table named by `config`. Both live in the
/// same database file.
pub fn open_sqlite(config: &DoclinkConfig) -> Result<SqlitePipeline> {
    let identity_path = config.identity_path.as_ref().ok_or_else(|| {
        DoclinkError::Config("identity_path (or DOCLINK_IDENTITY) must be set".to_string())
    })?;
    let identity = load_identity(identity_path)?;
    let store = SqliteChunkStore::open(&config.database, config.embedding_dimensions)?
        .with_data_key_guard();
    let keys = SqliteKeyStore::open(&config.database, identity)?;
    Ok(RetrievalPipeline::new(store, keys, config))
}
