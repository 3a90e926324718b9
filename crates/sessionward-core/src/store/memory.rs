use std::sync::{Mutex, PoisonError};

use crate::error::StoreError;

use super::SessionPersistence;

/// Keeps the session blob in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blob: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a blob already stored, as if written by an earlier run.
    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
        }
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self.blob.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, blob: &str) -> Result<(), StoreError> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(blob.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.blob.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}
