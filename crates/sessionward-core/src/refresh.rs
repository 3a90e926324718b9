//! Single-flight token refresh.
//!
//! `RefreshCoordinator` collapses any number of concurrent "this token was
//! rejected" signals into one refresh exchange. The first caller starts the
//! exchange on its own task; everyone arriving while it runs awaits the same
//! shared outcome. The task writes the result to the session store before it
//! returns to idle and releases the waiters, all at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::exchange::ExchangeClient;
use crate::session::Session;
use crate::store::SessionStore;

type SharedRefresh = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// The refresh currently in flight, tagged so only its own task clears it.
struct InFlight {
    id: u64,
    outcome: SharedRefresh,
}

type Slot = Arc<Mutex<Option<InFlight>>>;

/// Clears the in-flight slot when the refresh task ends, including by panic.
struct SlotGuard {
    slot: Slot,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|f| f.id == self.id) {
            *slot = None;
        }
    }
}

pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    exchange: Arc<ExchangeClient>,
    in_flight: Slot,
    next_id: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, exchange: Arc<ExchangeClient>) -> Self {
        Self {
            store,
            exchange,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Whether a refresh exchange is running right now.
    pub fn is_refreshing(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Obtain a freshly refreshed session, joining the in-flight refresh if
    /// there is one. Fails with `NotLoggedIn` without touching the network
    /// when there is no session to refresh.
    pub async fn ensure_fresh_session(&self) -> Result<Session, AuthError> {
        self.refresh(None).await
    }

    /// Like `ensure_fresh_session`, but returns the stored session directly
    /// when it no longer carries `rejected_access_token`, i.e. another flow
    /// already rotated it.
    pub async fn refresh_after_rejection(
        &self,
        rejected_access_token: &str,
    ) -> Result<Session, AuthError> {
        self.refresh(Some(rejected_access_token)).await
    }

    async fn refresh(&self, rejected_access_token: Option<&str>) -> Result<Session, AuthError> {
        let outcome = {
            let mut slot = self.lock_slot();
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight refresh");
                    in_flight.outcome.clone()
                }
                None => {
                    // A finished refresh writes the store before freeing the
                    // slot, so this read already sees its result.
                    let current = self.store.get().ok_or(AuthError::NotLoggedIn)?;

                    if let Some(rejected) = rejected_access_token {
                        if current.access_token() != rejected {
                            debug!("Access token already rotated, skipping refresh");
                            return Ok(current);
                        }
                    }

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.spawn_refresh(id, current);
                    *slot = Some(InFlight {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };

        // Dropping this future only stops this caller from waiting; the
        // spawned task keeps running for everyone else.
        outcome.await
    }

    fn spawn_refresh(&self, id: u64, current: Session) -> SharedRefresh {
        let store = self.store.clone();
        let exchange = self.exchange.clone();
        let guard = SlotGuard {
            slot: self.in_flight.clone(),
            id,
        };

        info!(user_id = %current.user_id(), "Starting token refresh");
        let task = tokio::spawn(async move {
            let outcome = match exchange.refresh(&current).await {
                Ok(session) => {
                    // The old refresh token is spent; the store keeps the new
                    // session in memory even if the backend write fails.
                    if let Err(e) = store.replace_refreshed(session.clone()) {
                        warn!(error = %e, "Failed to persist refreshed session");
                    }
                    Ok(session)
                }
                Err(AuthError::SessionExpired) => {
                    warn!("Refresh token rejected, clearing session");
                    if let Err(e) = store.expire() {
                        warn!(error = %e, "Failed to clear expired session from storage");
                    }
                    Err(AuthError::SessionExpired)
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh failed, keeping current session");
                    Err(e)
                }
            };
            // Back to idle before any waiter sees the outcome
            drop(guard);
            outcome
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(AuthError::ServerUnavailable(format!(
                    "refresh task ended unexpectedly: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared()
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
