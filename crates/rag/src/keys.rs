use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use age::{x25519, Decryptor, Encryptor};
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use secrecy::ExposeSecret;
use tracing::debug;

use doclink_core::{DoclinkError, FileId, FileKey, KeyStore};

use crate::schema;

/// Per-file data keys persisted in the `file_keys` table, each wrapped to an
/// age x25519 master identity. Unwrapped keys are cached for the lifetime of
/// the store.
pub struct SqliteKeyStore {
    path: PathBuf,
    identity: x25519::Identity,
    cache: RwLock<HashMap<FileId, Arc<FileKey>>>,
}

impl SqliteKeyStore {
    pub fn open<P: AsRef<Path>>(path: P, identity: x25519::Identity) -> doclink_core::Result<Self> {
        let path = path.as_ref().to_path_buf();
        schema::init(&path)?;
        Ok(Self {
            path,
            identity,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn recipient(&self) -> String {
        self.identity.to_public().to_string()
    }

    fn wrap(&self, key: &FileKey) -> Result<Vec<u8>> {
        let recipient = self.identity.to_public();
        let encryptor = Encryptor::with_recipients(vec![Box::new(recipient)])
            .ok_or_else(|| anyhow!("missing recipients"))?;
        let mut output = Vec::new();
        let mut writer = encryptor.wrap_output(&mut output)?;
        writer.write_all(key.expose())?;
        writer.finish()?;
        Ok(output)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<FileKey> {
        let decryptor = match Decryptor::new(wrapped)? {
            Decryptor::Recipients(d) => d,
            _ => return Err(anyhow!("wrapped key is not recipient-encrypted")),
        };
        let mut raw = Vec::new();
        let mut reader = decryptor.decrypt(std::iter::once(&self.identity as &dyn age::Identity))?;
        reader.read_to_end(&mut raw)?;
        Ok(FileKey::from_slice(&raw)?)
    }

    fn load_wrapped(&self, file_id: &FileId) -> Result<Option<Vec<u8>>> {
        let conn = schema::connect(&self.path)?;
        let wrapped = conn
            .query_row(
                "SELECT wrapped_key FROM file_keys WHERE file_id = ?1",
                [file_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(wrapped)
    }

    fn cached(&self, file_id: &FileId) -> Option<Arc<FileKey>> {
        self.cache.read().get(file_id).cloned()
    }

    fn remember(&self, file_id: &FileId, key: FileKey) -> Arc<FileKey> {
        let key = Arc::new(key);
        self.cache.write().insert(file_id.clone(), Arc::clone(&key));
        key
    }

    fn resolve_row(&self, file_id: &FileId) -> Result<Arc<FileKey>> {
        if let Some(key) = self.cached(file_id) {
            return Ok(key);
        }
        let wrapped = self
            .load_wrapped(file_id)?
            .ok_or_else(|| DoclinkError::Crypto(format!("no data key for file {file_id}")))?;
        let key = self.unwrap_key(&wrapped).map_err(|e| {
            DoclinkError::Crypto(format!("unwrapping data key for file {file_id}: {e:#}"))
        })?;
        Ok(self.remember(file_id, key))
    }

    fn provision_row(&self, file_id: &FileId) -> Result<Arc<FileKey>> {
        if let Some(key) = self.cached(file_id) {
            return Ok(key);
        }
        let candidate = FileKey::generate();
        let wrapped = self.wrap(&candidate)?;
        let conn = schema::connect(&self.path)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO file_keys (file_id, wrapped_key) VALUES (?1, ?2)",
            params![file_id.as_str(), wrapped],
        )?;
        if inserted == 0 {
            // An earlier ingestion (or a concurrent one) owns the key.
            return self.resolve_row(file_id);
        }
        debug!(file_id = %file_id, "provisioned data key");
        Ok(self.remember(file_id, candidate))
    }

    fn forget_row(&self, file_id: &FileId) -> Result<()> {
        let conn = schema::connect(&self.path)?;
        conn.execute("DELETE FROM file_keys WHERE file_id = ?1", [file_id.as_str()])?;
        self.cache.write().remove(file_id);
        Ok(())
    }
}

impl KeyStore for SqliteKeyStore {
    fn resolve_file_key(&self, file_id: &FileId) -> doclink_core::Result<Arc<FileKey>> {
        Ok(self.resolve_row(file_id)?)
    }

    fn provision_file_key(&self, file_id: &FileId) -> doclink_core::Result<Arc<FileKey>> {
        Ok(self.provision_row(file_id)?)
    }

    fn forget_file_key(&self, file_id: &FileId) -> doclink_core::Result<()> {
        Ok(self.forget_row(file_id)?)
    }
}

/// Reads the first non-comment line of an age identity file.
pub fn load_identity(path: &Path) -> doclink_core::Result<x25519::Identity> {
    let content = fs::read_to_string(path)?;
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| DoclinkError::Config(format!("{} is empty", path.display())))?;
    x25519::Identity::from_str(line)
        .map_err(|e| DoclinkError::Config(format!("invalid identity in {}: {e}", path.display())))
}

/// Generates a fresh identity and writes it in the age key-file layout.
/// Returns the public recipient string.
pub fn write_identity(path: &Path) -> doclink_core::Result<String> {
    let identity = x25519::Identity::generate();
    let recipient = identity.to_public().to_string();
    let contents = format!(
        "# public key: {recipient}\n{}\n",
        identity.to_string().expose_secret()
    );
    fs::write(path, contents)?;
    Ok(recipient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn provisioned_key_survives_a_fresh_store() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("keys.sqlite");
        let identity_path = dir.path().join("identity.txt");
        write_identity(&identity_path).unwrap();

        let file = FileId::new("f1");
        let first = SqliteKeyStore::open(&db, load_identity(&identity_path).unwrap()).unwrap();
        let key = first.provision_file_key(&file).unwrap();
        let again = first.provision_file_key(&file).unwrap();
        assert_eq!(key.expose(), again.expose());

        let second = SqliteKeyStore::open(&db, load_identity(&identity_path).unwrap()).unwrap();
        let resolved = second.resolve_file_key(&file).unwrap();
        assert_eq!(key.expose(), resolved.expose());
    }

    #[test]
    fn wrong_identity_cannot_unwrap() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("keys.sqlite");
        let file = FileId::new("f1");
        let owner = SqliteKeyStore::open(&db, x25519::Identity::generate()).unwrap();
        owner.provision_file_key(&file).unwrap();

        let stranger = SqliteKeyStore::open(&db, x25519::Identity::generate()).unwrap();
        assert!(stranger.resolve_file_key(&file).is_err());
    }

    #[test]
    fn forgotten_key_is_gone() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("keys.sqlite");
        let store = SqliteKeyStore::open(&db, x25519::Identity::generate()).unwrap();
        let file = FileId::new("f1");
        store.provision_file_key(&file).unwrap();
        store.forget_file_key(&file).unwrap();
        assert!(matches!(
            store.resolve_file_key(&file),
            Err(DoclinkError::Crypto(_))
        ));
        store.forget_file_key(&file).unwrap();
    }

    #[test]
    fn identity_file_skips_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.txt");
        let recipient = write_identity(&path).unwrap();
        let identity = load_identity(&path).unwrap();
        assert_eq!(identity.to_public().to_string(), recipient);
    }
}
