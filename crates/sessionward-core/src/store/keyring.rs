use ::keyring::{Entry, Error as KeyringError};

use crate::error::StoreError;

use super::SessionPersistence;

/// Default keychain service name
pub const DEFAULT_SERVICE: &str = "sessionward";

/// Keychain account under which the session blob is stored
const SESSION_ACCOUNT: &str = "session";

/// Stores the session blob in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeyringPersistence {
    service: String,
    account: String,
}

impl KeyringPersistence {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: SESSION_ACCOUNT.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| StoreError::Keyring(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringPersistence {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl SessionPersistence for KeyringPersistence {
    fn load(&self) -> Result<Option<String>, StoreError> {
        match self.entry()?.get_password() {
            Ok(blob) => Ok(Some(blob)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(format!(
                "Failed to retrieve session from keychain: {}",
                e
            ))),
        }
    }

    fn save(&self, blob: &str) -> Result<(), StoreError> {
        self.entry()?
            .set_password(blob)
            .map_err(|e| StoreError::Keyring(format!("Failed to store session in keychain: {}", e)))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(format!(
                "Failed to delete session from keychain: {}",
                e
            ))),
        }
    }
}
