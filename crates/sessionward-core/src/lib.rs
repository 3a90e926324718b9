//! Sessionward Core - client-side session management for token-based APIs.
//!
//! This crate keeps one authenticated session (user id, access token,
//! refresh token) and makes every outgoing request carry it:
//! - Session store with pluggable persistence (file, keychain, encrypted)
//! - Credential exchange for login and token refresh
//! - Auth pipeline that attaches credentials and retries once after a 401
//! - Single-flight refresh coordination across concurrent requests
//! - Login form controller with credential validation

pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod http;
pub mod login;
pub mod pipeline;
pub mod refresh;
pub mod session;
pub mod store;
pub mod validation;

#[cfg(test)]
mod testing;

pub use client::AuthClient;
pub use config::{Config, StorageBackend};
pub use error::{AuthError, StoreError, TransportError};
pub use exchange::{ApiKey, ExchangeClient, ExchangeEndpoints};
pub use http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use login::{LoginAction, LoginController, LoginViewState, SubmitOutcome};
pub use pipeline::AuthPipeline;
pub use refresh::RefreshCoordinator;
pub use session::{Credentials, PersistedSession, Session, SessionEvent};
pub use store::{SessionPersistence, SessionStore};
pub use validation::{PasswordValidationState, UserDataValidator};
