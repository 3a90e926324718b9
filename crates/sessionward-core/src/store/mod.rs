//! Session storage: the single source of truth for credential state.
//!
//! This module provides:
//! - `SessionStore`: in-memory current session with atomic get/set/clear,
//!   mirrored into a persistence backend so it survives restarts
//! - `SessionPersistence`: the key-value boundary the store writes through
//! - Backends: memory, plain JSON file, OS keychain, encrypted file

pub mod encrypted;
pub mod file;
pub mod keyring;
pub mod memory;

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::session::{PersistedSession, Session, SessionEvent};

pub use self::encrypted::EncryptedFilePersistence;
pub use self::file::FilePersistence;
pub use self::keyring::KeyringPersistence;
pub use self::memory::MemoryPersistence;

/// Buffer size for the session event channel.
/// Subscribers that fall further behind than this miss events, not sessions.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Opaque blob storage for the serialized session.
pub trait SessionPersistence: Send + Sync {
    /// Returns `Ok(None)` when nothing has been stored.
    fn load(&self) -> Result<Option<String>, StoreError>;

    fn save(&self, blob: &str) -> Result<(), StoreError>;

    /// Removing a blob that does not exist is not an error.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Holds the current session, or none.
///
/// Reads go through an `RwLock` and never block on persistence; writes are
/// serialized by a separate mutex so only one writer touches the backend at a
/// time. A reader racing a writer sees either the old or the new session.
pub struct SessionStore {
    persistence: Arc<dyn SessionPersistence>,
    current: RwLock<Option<PersistedSession>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// Reconstruct the store from whatever the backend holds.
    ///
    /// A blob that cannot be decoded is cleared and the store starts empty.
    /// Any other load failure leaves the backend untouched.
    pub fn open(persistence: Arc<dyn SessionPersistence>) -> Self {
        let current = match persistence.load() {
            Ok(Some(blob)) => match serde_json::from_str::<PersistedSession>(&blob) {
                Ok(persisted) => {
                    debug!(user_id = %persisted.session.user_id(), "Loaded persisted session");
                    Some(persisted)
                }
                Err(e) => {
                    Self::discard_corrupted(persistence.as_ref(), &StoreError::from(e));
                    None
                }
            },
            Ok(None) => {
                debug!("No persisted session");
                None
            }
            Err(e @ StoreError::Corrupted(_)) => {
                Self::discard_corrupted(persistence.as_ref(), &e);
                None
            }
            // Includes a wrong passphrase, which must not destroy the session
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting logged out");
                None
            }
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            persistence,
            current: RwLock::new(current),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryPersistence::new()))
    }

    fn discard_corrupted(persistence: &dyn SessionPersistence, cause: &StoreError) {
        warn!(error = %cause, "Persisted session is corrupted, discarding it");
        if let Err(e) = persistence.clear() {
            warn!(error = %e, "Failed to clear corrupted session");
        }
    }

    pub fn get(&self) -> Option<Session> {
        self.read().as_ref().map(|p| p.session.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        self.read().is_some()
    }

    /// When the current session was written, if there is one.
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.read().as_ref().map(|p| p.saved_at)
    }

    /// The current session together with its persistence timestamp.
    pub fn snapshot(&self) -> Option<PersistedSession> {
        self.read().clone()
    }

    /// Replace the current session after a login.
    ///
    /// On error the in-memory session is left as it was.
    pub fn set(&self, session: Session) -> Result<(), StoreError> {
        let event = SessionEvent::LoggedIn {
            user_id: session.user_id().to_string(),
        };
        self.write(session, event, false)
    }

    /// Replace the current session with the outcome of a refresh exchange.
    ///
    /// The server has already rotated the tokens, so the new session becomes
    /// current even when the backend write fails; the error is still returned.
    pub fn replace_refreshed(&self, session: Session) -> Result<(), StoreError> {
        let event = SessionEvent::Refreshed {
            user_id: session.user_id().to_string(),
        };
        self.write(session, event, true)
    }

    /// Remove the session (explicit logout).
    ///
    /// The in-memory session is dropped even if the backend fails, so the
    /// user is never left authenticated after asking to log out.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.remove(SessionEvent::LoggedOut)
    }

    /// Remove the session because the server rejected its refresh token.
    pub fn expire(&self) -> Result<(), StoreError> {
        self.remove(SessionEvent::Expired)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn write(
        &self,
        session: Session,
        event: SessionEvent,
        keep_unsaved: bool,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let persisted = PersistedSession::new(session);
        let saved = serde_json::to_string(&persisted)
            .map_err(StoreError::from)
            .and_then(|blob| self.persistence.save(&blob));
        if let Err(e) = &saved {
            if !keep_unsaved {
                return Err(e.clone());
            }
            warn!(error = %e, "Session not persisted, keeping it in memory only");
        }

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(persisted);
        info!(?event, "Session stored");
        // No subscribers is fine
        let _ = self.events.send(event);
        saved
    }

    fn remove(&self, event: SessionEvent) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = self.persistence.clear();

        if previous.is_some() {
            info!(?event, "Session removed");
            let _ = self.events.send(event);
        }
        result
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<PersistedSession>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}
