//! Per-file authenticated encryption of chunk text.
//!
//! Every chunk is sealed with AES-256-GCM under its file's data key, a fresh
//! random nonce and the file id as associated data. Keys come from a
//! [`KeyStore`] handed to the vault at construction.

use std::sync::Arc;

use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};

use crate::codec::SealedText;
use crate::error::{DoclinkError, Result};
use crate::model::FileId;

pub const KEY_LEN: usize = 32;

pub struct FileKey(Secret<[u8; KEY_LEN]>);

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Secret::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            DoclinkError::Crypto(format!(
                "file key is {} bytes, expected {KEY_LEN}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(array))
    }

    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self::from_bytes(bytes)
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.expose()))
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey([redacted])")
    }
}

/// Source of per-file data keys. Implementations decide how keys are
/// protected at rest; the vault only ever sees resolved keys.
pub trait KeyStore: Send + Sync {
    fn resolve_file_key(&self, file_id: &FileId) -> Result<Arc<FileKey>>;

    /// Called once when a file is first ingested.
    fn provision_file_key(&self, file_id: &FileId) -> Result<Arc<FileKey>> {
        self.resolve_file_key(file_id)
    }

    /// Called after a file's chunks are gone.
    fn forget_file_key(&self, _file_id: &FileId) -> Result<()> {
        Ok(())
    }
}

impl<K: KeyStore + ?Sized> KeyStore for Arc<K> {
    fn resolve_file_key(&self, file_id: &FileId) -> Result<Arc<FileKey>> {
        (**self).resolve_file_key(file_id)
    }

    fn provision_file_key(&self, file_id: &FileId) -> Result<Arc<FileKey>> {
        (**self).provision_file_key(file_id)
    }

    fn forget_file_key(&self, file_id: &FileId) -> Result<()> {
        (**self).forget_file_key(file_id)
    }
}

/// Derives each file key as SHA-256(seed || 0x00 || file id). Deterministic,
/// so only suitable for tests and local tooling.
pub struct DeterministicKeyStore {
    seed: Secret<Vec<u8>>,
}

impl DeterministicKeyStore {
    pub fn new(seed: impl Into<Vec<u8>>) -> Self {
        Self {
            seed: Secret::new(seed.into()),
        }
    }
}

impl KeyStore for DeterministicKeyStore {
    fn resolve_file_key(&self, file_id: &FileId) -> Result<Arc<FileKey>> {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.expose_secret());
        hasher.update([0u8]);
        hasher.update(file_id.as_str().as_bytes());
        let digest = hasher.finalize();
        Ok(Arc::new(FileKey::from_slice(digest.as_slice())?))
    }
}

pub struct CryptoVault<K> {
    keys: K,
}

impl<K: KeyStore> CryptoVault<K> {
    pub fn new(keys: K) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &K {
        &self.keys
    }

    pub fn encrypt(&self, file_id: &FileId, plaintext: &str) -> Result<SealedText> {
        let key = self.keys.resolve_file_key(file_id)?;
        seal(&key, file_id, plaintext)
    }

    pub fn decrypt(&self, file_id: &FileId, sealed: &SealedText) -> Result<String> {
        let key = self.keys.resolve_file_key(file_id)?;
        open(&key, file_id, sealed)
    }
}

/// Seals with an already resolved key. Used on ingestion so a batch
/// resolves its key once.
pub fn seal(key: &FileKey, file_id: &FileId, plaintext: &str) -> Result<SealedText> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(&nonce, file_id.as_str().as_bytes(), &mut buffer)
        .map_err(|_| DoclinkError::Crypto("chunk encryption failed".to_string()))?;
    SealedText::from_parts(nonce.as_slice(), buffer, tag.as_slice())
}

pub fn open(key: &FileKey, file_id: &FileId, sealed: &SealedText) -> Result<String> {
    let mut buffer = sealed.ciphertext.clone();
    key.cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            file_id.as_str().as_bytes(),
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| DoclinkError::AuthenticationFailure {
            file_id: file_id.to_string(),
        })?;
    String::from_utf8(buffer)
        .map_err(|_| DoclinkError::malformed("authenticated chunk text is not valid utf-8"))
}
