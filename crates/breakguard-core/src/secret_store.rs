//! Sealed at-rest storage for enrollment secrets
//!
//! The TOTP secret, the face template and the remote power-switch
//! credential are each kept in their own file, encrypted with
//! ChaCha20-Poly1305 under a store key generated on first use.
//!
//! # Storage Format
//!
//! - `store.key`: hex-encoded 32-byte store key (mode 0600)
//! - `<record>.enc`: 12-byte nonce, then the JSON record encrypted with
//!   the store key (16-byte tag appended by ChaCha20-Poly1305)

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::PersistenceError;
use crate::fsutil::{remove_if_exists, write_atomic};

/// Size of the nonce for ChaCha20-Poly1305
const NONCE_SIZE: usize = 12;

/// Size of the store key
const KEY_SIZE: usize = 32;

const KEY_FILE_NAME: &str = "store.key";

/// Records the store knows how to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretRecord {
    /// TOTP shared secret and parameters
    TotpSecret,
    /// Enrolled face template
    FaceTemplate,
    /// Credential for the monitor power switch
    PowerCredential,
}

impl SecretRecord {
    fn file_name(self) -> &'static str {
        match self {
            SecretRecord::TotpSecret => "totp.enc",
            SecretRecord::FaceTemplate => "face.enc",
            SecretRecord::PowerCredential => "power.enc",
        }
    }
}

/// Encrypting record store, opened once per process and shared
pub struct SecretStore {
    base_path: PathBuf,
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl SecretStore {
    /// Open the store in `base_path`, creating the store key on first use
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        let key_path = base_path.join(KEY_FILE_NAME);
        let key = if key_path.exists() {
            Self::read_key(&key_path)?
        } else {
            let mut key = Zeroizing::new([0u8; KEY_SIZE]);
            OsRng.fill_bytes(&mut key[..]);
            let encoded = Zeroizing::new(hex::encode(&key[..]));
            write_atomic(&key_path, encoded.as_bytes(), true)?;
            info!("Created secret store key at {:?}", key_path);
            key
        };

        Ok(Self { base_path, key })
    }

    /// Open a store with an explicit key (nothing is written for the key)
    pub fn with_key(base_path: impl Into<PathBuf>, key: [u8; KEY_SIZE]) -> Result<Self, PersistenceError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            key: Zeroizing::new(key),
        })
    }

    /// Whether a record file exists (readable or not)
    pub fn contains(&self, record: SecretRecord) -> bool {
        self.record_path(record).exists()
    }

    /// Encrypt and store a record, replacing any previous one
    pub fn seal<T: Serialize>(&self, record: SecretRecord, value: &T) -> Result<(), PersistenceError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| PersistenceError::Serialization(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        write_atomic(&self.record_path(record), &sealed, true)?;
        debug!("Sealed {:?}", record);
        Ok(())
    }

    /// Decrypt a record; `Ok(None)` when it was never stored
    ///
    /// A record that exists but fails authentication or parsing is
    /// reported as [`PersistenceError::Corrupt`], never as absent.
    pub fn unseal<T: DeserializeOwned>(&self, record: SecretRecord) -> Result<Option<T>, PersistenceError> {
        let path = self.record_path(record);
        if !path.exists() {
            return Ok(None);
        }

        let sealed = fs::read(&path)?;
        if sealed.len() < NONCE_SIZE {
            return Err(corrupt(&path, "file too short"));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| corrupt(&path, "authentication failed"))?,
        );

        let value = serde_json::from_slice(&plaintext)
            .map_err(|e| corrupt(&path, &format!("unreadable contents: {}", e)))?;
        Ok(Some(value))
    }

    /// Delete a record
    pub fn remove(&self, record: SecretRecord) -> Result<(), PersistenceError> {
        remove_if_exists(&self.record_path(record))?;
        info!("Removed {:?}", record);
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    fn record_path(&self, record: SecretRecord) -> PathBuf {
        self.base_path.join(record.file_name())
    }

    fn read_key(path: &Path) -> Result<Zeroizing<[u8; KEY_SIZE]>, PersistenceError> {
        let encoded = Zeroizing::new(fs::read_to_string(path)?);
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|e| corrupt(path, &e.to_string()))?,
        );
        if bytes.len() != KEY_SIZE {
            return Err(corrupt(path, "invalid key length"));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&bytes[..]);
        Ok(key)
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

fn corrupt(path: &Path, reason: &str) -> PersistenceError {
    PersistenceError::Corrupt {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
