use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use crate::error::StoreError;

use super::SessionPersistence;

/// Encrypted session file name in the data directory
const SESSION_FILE: &str = "session.bin";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Cipher for one salt, so Argon2 runs once per salt rather than per write.
struct DerivedKey {
    salt: [u8; SALT_LEN],
    cipher: ChaCha20Poly1305,
}

/// Stores the session blob encrypted with ChaCha20-Poly1305.
///
/// The key is derived from a passphrase with Argon2. The salt is taken from
/// the file on load, or drawn at random on the first write, and then reused
/// with a fresh nonce for every later write. File layout:
/// `salt || nonce || ciphertext`.
#[derive(Clone)]
pub struct EncryptedFilePersistence {
    path: PathBuf,
    passphrase: String,
    derived: Arc<Mutex<Option<DerivedKey>>>,
}

impl EncryptedFilePersistence {
    pub fn new(dir: impl AsRef<Path>, passphrase: impl Into<String>) -> Self {
        Self {
            path: dir.as_ref().join(SESSION_FILE),
            passphrase: passphrase.into(),
            derived: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self, salt: [u8; SALT_LEN]) -> Result<ChaCha20Poly1305, StoreError> {
        let mut derived = self.derived.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = derived.as_ref().filter(|d| d.salt == salt) {
            return Ok(cached.cipher.clone());
        }

        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| StoreError::Crypto(format!("Key derivation failed: {}", e)))?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        *derived = Some(DerivedKey {
            salt,
            cipher: cipher.clone(),
        });
        Ok(cipher)
    }

    fn write_salt(&self) -> [u8; SALT_LEN] {
        let derived = self.derived.lock().unwrap_or_else(PoisonError::into_inner);
        match derived.as_ref() {
            Some(cached) => cached.salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                salt
            }
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let salt = self.write_salt();
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher(salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Crypto("Encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        if data.len() < SALT_LEN + NONCE_LEN {
            return Err(StoreError::Corrupted(format!(
                "encrypted session is only {} bytes",
                data.len()
            )));
        }
        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let salt = <[u8; SALT_LEN]>::try_from(salt)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;

        self.cipher(salt)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Crypto("Wrong passphrase or tampered session file".to_string()))
    }
}

impl SessionPersistence for EncryptedFilePersistence {
    fn load(&self) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&self.path)?;
        let plaintext = self.decrypt(&data)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|e| StoreError::Corrupted(e.to_string()))
    }

    fn save(&self, blob: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = self.encrypt(blob.as_bytes())?;
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
