//! `AuthClient` wires the session store, exchange client, refresh
//! coordinator and auth pipeline around one shared store.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AuthError;
use crate::exchange::{ApiKey, ExchangeClient, ExchangeEndpoints};
use crate::http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use crate::login::LoginController;
use crate::pipeline::AuthPipeline;
use crate::refresh::RefreshCoordinator;
use crate::session::{Credentials, Session, SessionEvent};
use crate::store::{SessionPersistence, SessionStore};
use crate::validation::UserDataValidator;

pub struct AuthClient {
    store: Arc<SessionStore>,
    exchange: Arc<ExchangeClient>,
    coordinator: Arc<RefreshCoordinator>,
    pipeline: AuthPipeline,
    logout_path: Option<String>,
}

impl AuthClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn SessionPersistence>,
        api_key: ApiKey,
        endpoints: ExchangeEndpoints,
    ) -> Self {
        let store = Arc::new(SessionStore::open(persistence));
        let exchange = Arc::new(ExchangeClient::new(
            transport.clone(),
            api_key.clone(),
            endpoints,
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange.clone()));
        let pipeline = AuthPipeline::new(transport, store.clone(), coordinator.clone(), api_key);

        Self {
            store,
            exchange,
            coordinator,
            pipeline,
            logout_path: None,
        }
    }

    /// Build a client over reqwest with the configured storage backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.base_url, config.request_timeout())
            .context("Failed to create HTTP client")?;
        let api_key = ApiKey::new(config.api_key()?).context("Invalid API key")?;
        let persistence = config.persistence()?;

        Ok(Self::new(Arc::new(transport), persistence, api_key, config.endpoints())
            .with_logout_path(config.logout_path.clone()))
    }

    /// Call this path (authenticated) on logout before clearing the session.
    pub fn with_logout_path(mut self, path: Option<String>) -> Self {
        self.logout_path = path;
        self
    }

    pub fn session(&self) -> Option<Session> {
        self.store.get()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.subscribe()
    }

    /// Login controller sharing this client's exchange and store.
    pub fn login_controller(&self, validator: UserDataValidator) -> LoginController {
        LoginController::new(self.exchange.clone(), self.store.clone(), validator)
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let session = self.exchange.login(credentials).await?;
        self.store.set(session.clone())?;
        Ok(session)
    }

    /// Tell the server (best effort) and forget the session locally.
    pub async fn logout(&self) -> Result<(), AuthError> {
        if let (Some(path), true) = (&self.logout_path, self.store.is_logged_in()) {
            match self.pipeline.get(path).await {
                Ok(response) if !response.is_success() => {
                    warn!(status = response.status.as_u16(), "Server-side logout failed");
                }
                Err(e) => warn!(error = %e, "Server-side logout failed"),
                Ok(_) => {}
            }
        }
        self.store.clear()?;
        info!("Logged out");
        Ok(())
    }

    pub async fn ensure_fresh_session(&self) -> Result<Session, AuthError> {
        self.coordinator.ensure_fresh_session().await
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        self.pipeline.send(request).await
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, AuthError> {
        self.pipeline.get(path).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HttpResponse, AuthError> {
        self.pipeline.post_json(path, body).await
    }
}
