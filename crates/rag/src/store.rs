use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use doclink_core::{
    decode_embedding, normalize_domain_name, Candidate, ChunkId, ChunkMeta, ChunkStore,
    DoclinkError, DomainId, DomainSummary, FileId, FileRecord, FileSummary, PlanTier, Scope,
    SealedChunk, SealedText, StoredText, Usage, UserId, MAX_DOMAIN_NAME_CHARS,
};

use crate::schema;

/// SQLite-backed [`ChunkStore`]. Embeddings are stored as codec blobs next
/// to the sealed text; every call opens its own connection.
#[derive(Clone)]
pub struct SqliteChunkStore {
    path: PathBuf,
    dimensions: usize,
    require_data_keys: bool,
}

struct CandidateRow {
    meta: ChunkMeta,
    embedding: Vec<u8>,
}

impl SqliteChunkStore {
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> doclink_core::Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            dimensions,
            require_data_keys: false,
        };
        schema::init(&store.path)?;
        Ok(store)
    }

    /// Refuse to store chunks for a file whose row in `file_keys` is gone.
    /// Set when the key table in the same database is the key source, so a
    /// delete racing an ingestion cannot leave chunks sealed under a
    /// forgotten key.
    pub fn with_data_key_guard(mut self) -> Self {
        self.require_data_keys = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn put_chunks_tx(&self, file: &FileRecord, chunks: &[SealedChunk]) -> Result<usize> {
        let mut conn = schema::connect(&self.path)?;
        let tx = schema::begin_write(&mut conn)?;
        require_domain_owner(&tx, &file.domain_id, &file.user_id)?;
        if self.require_data_keys {
            let has_key: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM file_keys WHERE file_id = ?1)",
                [file.file_id.as_str()],
                |row| row.get(0),
            )?;
            if !has_key {
                return Err(DoclinkError::Crypto(format!(
                    "no data key for file {}; chunks not stored",
                    file.file_id
                ))
                .into());
            }
        }
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT domain_id, user_id FROM files WHERE file_id = ?1",
                [file.file_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let modified_at = file.modified_at.map(|ts| ts.to_rfc3339());
        match existing {
            Some((domain_id, user_id)) => {
                if domain_id != file.domain_id.as_str() || user_id != file.user_id.as_str() {
                    return Err(DoclinkError::scope(format!(
                        "file {} belongs to another domain",
                        file.file_id
                    ))
                    .into());
                }
                tx.execute(
                    "UPDATE files SET file_name = ?2, modified_at = ?3 WHERE file_id = ?1",
                    params![file.file_id.as_str(), file.file_name, modified_at],
                )?;
                let replaced = tx.execute(
                    "DELETE FROM chunks WHERE file_id = ?1",
                    [file.file_id.as_str()],
                )?;
                debug!(file_id = %file.file_id, replaced, "replacing chunks on re-ingestion");
            }
            None => {
                tx.execute(
                    "INSERT INTO files \
                     (file_id, domain_id, user_id, file_name, uploaded_at, modified_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        file.file_id.as_str(),
                        file.domain_id.as_str(),
                        file.user_id.as_str(),
                        file.file_name,
                        Utc::now().to_rfc3339(),
                        modified_at
                    ],
                )?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (file_id, ordinal, page_number, is_header, is_table, \
                 embedding, ciphertext, nonce, auth_tag) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    file.file_id.as_str(),
                    chunk.ordinal,
                    chunk.page_number,
                    chunk.is_header,
                    chunk.is_table,
                    chunk.embedding,
                    chunk.sealed.ciphertext,
                    &chunk.sealed.nonce[..],
                    &chunk.sealed.tag[..],
                ])?;
            }
        }
        tx.commit()?;
        info!(file_id = %file.file_id, chunks = chunks.len(), "stored file chunks");
        Ok(chunks.len())
    }

    fn get_candidates_tx(&self, scope: &Scope) -> Result<Vec<Candidate>> {
        let mut conn = schema::connect(&self.path)?;
        // One read transaction: the ownership check and the scan see the
        // same snapshot.
        let tx = conn.transaction()?;
        require_domain_owner(&tx, &scope.domain_id, &scope.user_id)?;

        let mut sql = String::from(
            r#"
            SELECT
                chunks.chunk_id,
                chunks.file_id,
                files.file_name,
                chunks.ordinal,
                chunks.page_number,
                chunks.is_header,
                chunks.is_table,
                chunks.embedding
            FROM chunks
            JOIN files ON chunks.file_id = files.file_id
            JOIN domains ON files.domain_id = domains.domain_id
            WHERE domains.domain_id = ?1 AND domains.user_id = ?2 AND files.user_id = ?2
            "#,
        );
        let mut values: Vec<&str> = vec![scope.domain_id.as_str(), scope.user_id.as_str()];
        if !scope.file_ids.is_empty() {
            require_files_in_scope(&tx, scope)?;
            let placeholders = (0..scope.file_ids.len())
                .map(|idx| format!("?{}", idx + 3))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND chunks.file_id IN ({placeholders})"));
            values.extend(scope.file_ids.iter().map(FileId::as_str));
        }
        sql.push_str(" ORDER BY chunks.chunk_id");

        let rows = {
            let mut stmt = tx.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok(CandidateRow {
                    meta: ChunkMeta {
                        chunk_id: row.get(0)?,
                        file_id: FileId::new(row.get::<_, String>(1)?),
                        file_name: row.get(2)?,
                        ordinal: row.get(3)?,
                        page_number: row.get(4)?,
                        is_header: row.get(5)?,
                        is_table: row.get(6)?,
                    },
                    embedding: row.get(7)?,
                })
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_embedding(&row.embedding, self.dimensions) {
                Ok(embedding) => candidates.push(Candidate {
                    meta: row.meta,
                    embedding,
                }),
                Err(err) => warn!(
                    target: "doclink::integrity",
                    chunk_id = row.meta.chunk_id,
                    file_id = %row.meta.file_id,
                    error = %err,
                    "skipping chunk with unreadable embedding"
                ),
            }
        }
        debug!(
            user_id = %scope.user_id,
            domain_id = %scope.domain_id,
            candidates = candidates.len(),
            "resolved candidate set"
        );
        Ok(candidates)
    }

    fn get_chunk_text_row(&self, chunk_id: ChunkId) -> Result<StoredText> {
        let conn = schema::connect(&self.path)?;
        let row: Option<(String, Vec<u8>, Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT file_id, ciphertext, nonce, auth_tag FROM chunks WHERE chunk_id = ?1",
                [chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let (file_id, ciphertext, nonce, tag) =
            row.ok_or_else(|| DoclinkError::chunk_not_found(chunk_id))?;
        Ok(StoredText {
            chunk_id,
            file_id: FileId::new(file_id),
            sealed: SealedText::from_parts(&nonce, ciphertext, &tag)?,
        })
    }

    fn delete_file_tx(&self, file_id: &FileId) -> Result<bool> {
        let mut conn = schema::connect(&self.path)?;
        let tx = schema::begin_write(&mut conn)?;
        let chunks = tx.execute("DELETE FROM chunks WHERE file_id = ?1", [file_id.as_str()])?;
        let files = tx.execute("DELETE FROM files WHERE file_id = ?1", [file_id.as_str()])?;
        tx.execute("DELETE FROM file_keys WHERE file_id = ?1", [file_id.as_str()])?;
        tx.commit()?;
        if files > 0 {
            info!(file_id = %file_id, chunks, "deleted file");
        }
        Ok(files > 0)
    }

    fn delete_domain_tx(&self, domain_id: &DomainId) -> Result<Vec<FileId>> {
        let mut conn = schema::connect(&self.path)?;
        let tx = schema::begin_write(&mut conn)?;
        let file_ids = {
            let mut stmt = tx.prepare("SELECT file_id FROM files WHERE domain_id = ?1")?;
            let ids = stmt.query_map([domain_id.as_str()], |row| row.get::<_, String>(0))?;
            ids.map(|id| id.map(FileId::new))
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        // content -> keys -> files -> domain
        let chunks = tx.execute(
            "DELETE FROM chunks WHERE file_id IN (SELECT file_id FROM files WHERE domain_id = ?1)",
            [domain_id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM file_keys \
             WHERE file_id IN (SELECT file_id FROM files WHERE domain_id = ?1)",
            [domain_id.as_str()],
        )?;
        tx.execute("DELETE FROM files WHERE domain_id = ?1", [domain_id.as_str()])?;
        let domains = tx.execute(
            "DELETE FROM domains WHERE domain_id = ?1",
            [domain_id.as_str()],
        )?;
        tx.commit()?;
        if domains > 0 {
            info!(domain_id = %domain_id, files = file_ids.len(), chunks, "deleted domain");
        }
        Ok(file_ids)
    }

    fn ensure_user_row(&self, user_id: &UserId, tier: PlanTier) -> Result<()> {
        let conn = schema::connect(&self.path)?;
        conn.execute(
            "INSERT INTO users (user_id, plan_tier) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET plan_tier = excluded.plan_tier",
            params![user_id.as_str(), tier.as_str()],
        )?;
        Ok(())
    }

    fn create_domain_row(
        &self,
        user_id: &UserId,
        name: &str,
        domain_id: Option<DomainId>,
    ) -> Result<DomainId> {
        let name = valid_domain_name(name)?;
        let domain_id = domain_id.unwrap_or_else(|| DomainId::new(Uuid::new_v4().to_string()));
        let mut conn = schema::connect(&self.path)?;
        let tx = schema::begin_write(&mut conn)?;
        tx.execute(
            "INSERT OR IGNORE INTO users (user_id, plan_tier) VALUES (?1, 'free')",
            [user_id.as_str()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO domains (domain_id, user_id, name) VALUES (?1, ?2, ?3)",
            params![domain_id.as_str(), user_id.as_str(), name],
        )?;
        if inserted == 0 {
            return Err(DoclinkError::invalid(format!("domain {domain_id} already exists")).into());
        }
        tx.commit()?;
        info!(user_id = %user_id, domain_id = %domain_id, "created domain");
        Ok(domain_id)
    }

    fn rename_domain_row(&self, user_id: &UserId, domain_id: &DomainId, name: &str) -> Result<()> {
        let name = valid_domain_name(name)?;
        let mut conn = schema::connect(&self.path)?;
        let tx = schema::begin_write(&mut conn)?;
        require_domain_owner(&tx, domain_id, user_id)?;
        tx.execute(
            "UPDATE domains SET name = ?2 WHERE domain_id = ?1",
            params![domain_id.as_str(), name],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_domains_rows(&self, user_id: &UserId) -> Result<Vec<DomainSummary>> {
        let mut conn = schema::connect(&self.path)?;
        let tx = conn.transaction()?;
        let domains = {
            let mut stmt = tx.prepare(
                "SELECT domain_id, name FROM domains WHERE user_id = ?1 \
                 ORDER BY created_at, domain_id",
            )?;
            let rows = stmt.query_map([user_id.as_str()], |row| {
                Ok((DomainId::new(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut summaries = Vec::with_capacity(domains.len());
        for (domain_id, name) in domains {
            let files = files_in_domain(&tx, &domain_id)?;
            summaries.push(DomainSummary {
                domain_id,
                name,
                files,
            });
        }
        tx.commit()?;
        Ok(summaries)
    }

    fn list_files_rows(&self, user_id: &UserId, domain_id: &DomainId) -> Result<Vec<FileSummary>> {
        let mut conn = schema::connect(&self.path)?;
        let tx = conn.transaction()?;
        require_domain_owner(&tx, domain_id, user_id)?;
        let files = files_in_domain(&tx, domain_id)?;
        tx.commit()?;
        Ok(files)
    }

    fn domain_owner_row(&self, domain_id: &DomainId) -> Result<Option<UserId>> {
        let conn = schema::connect(&self.path)?;
        let owner = conn
            .query_row(
                "SELECT user_id FROM domains WHERE domain_id = ?1",
                [domain_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(owner.map(UserId::new))
    }

    fn file_owner_row(&self, file_id: &FileId) -> Result<Option<(UserId, DomainId)>> {
        let conn = schema::connect(&self.path)?;
        let owner = conn
            .query_row(
                "SELECT user_id, domain_id FROM files WHERE file_id = ?1",
                [file_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(owner.map(|(user, domain)| (UserId::new(user), DomainId::new(domain))))
    }

    fn usage_rows(&self, user_id: &UserId) -> Result<Usage> {
        let conn = schema::connect(&self.path)?;
        let tier: Option<String> = conn
            .query_row(
                "SELECT plan_tier FROM users WHERE user_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let tier = tier.ok_or_else(|| DoclinkError::NotFound(format!("user {user_id}")))?;
        let tier = PlanTier::parse(&tier)
            .ok_or_else(|| DoclinkError::malformed(format!("unknown plan tier {tier}")))?;
        let domains: i64 = conn.query_row(
            "SELECT COUNT(*) FROM domains WHERE user_id = ?1",
            [user_id.as_str()],
            |row| row.get(0),
        )?;
        let files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE user_id = ?1",
            [user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(Usage {
            tier,
            domains: domains as usize,
            files: files as usize,
        })
    }
}

impl ChunkStore for SqliteChunkStore {
    fn put_chunks(&self, file: &FileRecord, chunks: &[SealedChunk]) -> doclink_core::Result<usize> {
        Ok(self.put_chunks_tx(file, chunks)?)
    }

    fn get_candidates(&self, scope: &Scope) -> doclink_core::Result<Vec<Candidate>> {
        Ok(self.get_candidates_tx(scope)?)
    }

    fn get_chunk_text(&self, chunk_id: ChunkId) -> doclink_core::Result<StoredText> {
        Ok(self.get_chunk_text_row(chunk_id)?)
    }

    fn delete_file(&self, file_id: &FileId) -> doclink_core::Result<bool> {
        Ok(self.delete_file_tx(file_id)?)
    }

    fn delete_domain(&self, domain_id: &DomainId) -> doclink_core::Result<Vec<FileId>> {
        Ok(self.delete_domain_tx(domain_id)?)
    }

    fn ensure_user(&self, user_id: &UserId, tier: PlanTier) -> doclink_core::Result<()> {
        Ok(self.ensure_user_row(user_id, tier)?)
    }

    fn create_domain(
        &self,
        user_id: &UserId,
        name: &str,
        domain_id: Option<DomainId>,
    ) -> doclink_core::Result<DomainId> {
        Ok(self.create_domain_row(user_id, name, domain_id)?)
    }

    fn rename_domain(
        &self,
        user_id: &UserId,
        domain_id: &DomainId,
        name: &str,
    ) -> doclink_core::Result<()> {
        Ok(self.rename_domain_row(user_id, domain_id, name)?)
    }

    fn list_domains(&self, user_id: &UserId) -> doclink_core::Result<Vec<DomainSummary>> {
        Ok(self.list_domains_rows(user_id)?)
    }

    fn list_files(
        &self,
        user_id: &UserId,
        domain_id: &DomainId,
    ) -> doclink_core::Result<Vec<FileSummary>> {
        Ok(self.list_files_rows(user_id, domain_id)?)
    }

    fn domain_owner(&self, domain_id: &DomainId) -> doclink_core::Result<Option<UserId>> {
        Ok(self.domain_owner_row(domain_id)?)
    }

    fn file_owner(&self, file_id: &FileId) -> doclink_core::Result<Option<(UserId, DomainId)>> {
        Ok(self.file_owner_row(file_id)?)
    }

    fn usage(&self, user_id: &UserId) -> doclink_core::Result<Usage> {
        Ok(self.usage_rows(user_id)?)
    }
}

fn require_domain_owner(
    tx: &Transaction<'_>,
    domain_id: &DomainId,
    user_id: &UserId,
) -> Result<()> {
    let owner: Option<String> = tx
        .query_row(
            "SELECT user_id FROM domains WHERE domain_id = ?1",
            [domain_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == user_id.as_str() => Ok(()),
        _ => Err(DoclinkError::scope(format!(
            "domain {domain_id} is not owned by user {user_id}"
        ))
        .into()),
    }
}

/// Explicit file filters may only name files of the scoped domain. Ids that
/// no longer exist are ignored; ids owned elsewhere reject the whole query.
fn require_files_in_scope(tx: &Transaction<'_>, scope: &Scope) -> Result<()> {
    let placeholders = (0..scope.file_ids.len())
        .map(|idx| format!("?{}", idx + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT COUNT(*) FROM files WHERE file_id IN ({placeholders}) \
         AND (domain_id != ?1 OR user_id != ?2)"
    );
    let mut values: Vec<&str> = vec![scope.domain_id.as_str(), scope.user_id.as_str()];
    values.extend(scope.file_ids.iter().map(FileId::as_str));
    let foreign: i64 = tx.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
    if foreign > 0 {
        return Err(DoclinkError::scope(format!(
            "{foreign} requested file(s) are outside domain {}",
            scope.domain_id
        ))
        .into());
    }
    Ok(())
}

fn files_in_domain(tx: &Transaction<'_>, domain_id: &DomainId) -> Result<Vec<FileSummary>> {
    let mut stmt = tx.prepare(
        r#"
        SELECT files.file_id, files.file_name, files.uploaded_at, files.modified_at,
               COUNT(chunks.chunk_id)
        FROM files
        LEFT JOIN chunks ON chunks.file_id = files.file_id
        WHERE files.domain_id = ?1
        GROUP BY files.file_id
        ORDER BY files.uploaded_at, files.file_id
        "#,
    )?;
    let rows = stmt.query_map([domain_id.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;
    let mut files = Vec::new();
    for row in rows {
        let (file_id, file_name, uploaded_at, modified_at, chunk_count) = row?;
        files.push(FileSummary {
            file_id: FileId::new(file_id),
            file_name,
            uploaded_at: parse_timestamp(&uploaded_at)?,
            modified_at: modified_at.as_deref().map(parse_timestamp).transpose()?,
            chunk_count: chunk_count as usize,
        });
    }
    Ok(files)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| anyhow!(DoclinkError::malformed(format!("bad timestamp {raw}: {e}"))))
}

fn valid_domain_name(name: &str) -> Result<String> {
    normalize_domain_name(name).ok_or_else(|| {
        anyhow!(DoclinkError::invalid(format!(
            "domain name must be 1 to {MAX_DOMAIN_NAME_CHARS} characters"
        )))
    })
}
