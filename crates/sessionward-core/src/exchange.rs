//! Credential exchange client.
//!
//! Performs the two unauthenticated calls of the session lifecycle: login
//! (credentials in, session out) and refresh (refresh token in, session out).
//! These calls go straight to the transport and never through the auth
//! pipeline, so a refresh can never trigger another refresh.

use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{truncate_body, AuthError, TransportError};
use crate::http::{HttpRequest, HttpResponse, Transport, API_KEY_HEADER};
use crate::session::{Credentials, Session, SessionFields};

/// Default path of the login exchange
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// Default path of the refresh exchange
pub const DEFAULT_REFRESH_PATH: &str = "/accessToken";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEndpoints {
    pub login_path: String,
    pub refresh_path: String,
}

impl Default for ExchangeEndpoints {
    fn default() -> Self {
        Self {
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
        }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    user_id: &'a str,
}

/// Validated `x-api-key` header value.
#[derive(Debug, Clone)]
pub struct ApiKey(HeaderValue);

impl ApiKey {
    pub fn new(key: &str) -> Result<Self, TransportError> {
        let mut value = HeaderValue::from_str(key)
            .map_err(|_| TransportError::InvalidRequest("API key is not a valid header value".into()))?;
        value.set_sensitive(true);
        Ok(Self(value))
    }

    pub(crate) fn apply(&self, request: HttpRequest) -> HttpRequest {
        request.header(HeaderName::from_static(API_KEY_HEADER), self.0.clone())
    }
}

pub struct ExchangeClient {
    transport: Arc<dyn Transport>,
    api_key: ApiKey,
    endpoints: ExchangeEndpoints,
}

impl ExchangeClient {
    pub fn new(transport: Arc<dyn Transport>, api_key: ApiKey, endpoints: ExchangeEndpoints) -> Self {
        Self {
            transport,
            api_key,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &ExchangeEndpoints {
        &self.endpoints
    }

    /// Exchange raw credentials for a session. Never retries.
    ///
    /// 4xx maps to `InvalidCredentials`; 5xx or no response maps to
    /// `ServerUnavailable`.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let body = LoginRequest {
            email: &credentials.email,
            password: &credentials.password,
        };
        let request = self
            .api_key
            .apply(HttpRequest::post(&self.endpoints.login_path).json(&body)?);

        debug!(email = %credentials.email, "Sending login exchange");
        let response = self.transport.send(request).await.map_err(|e| {
            warn!(error = %e, "Login exchange did not complete");
            AuthError::from(e)
        })?;

        let session = Self::into_session(response, AuthError::InvalidCredentials, "login")?;
        info!(user_id = %session.user_id(), "Login exchange succeeded");
        Ok(session)
    }

    /// Exchange the session's refresh token for a new session. Never retries.
    ///
    /// 4xx maps to `SessionExpired`, which is terminal for `session`.
    pub async fn refresh(&self, session: &Session) -> Result<Session, AuthError> {
        let body = RefreshRequest {
            refresh_token: session.refresh_token(),
            user_id: session.user_id(),
        };
        let request = self
            .api_key
            .apply(HttpRequest::post(&self.endpoints.refresh_path).json(&body)?);

        debug!(user_id = %session.user_id(), "Sending refresh exchange");
        let response = self.transport.send(request).await.map_err(|e| {
            warn!(error = %e, "Refresh exchange did not complete");
            AuthError::from(e)
        })?;

        let refreshed = Self::into_session(response, AuthError::SessionExpired, "refresh")?;
        info!(user_id = %refreshed.user_id(), "Refresh exchange succeeded");
        Ok(refreshed)
    }

    fn into_session(
        response: HttpResponse,
        rejected: AuthError,
        exchange: &str,
    ) -> Result<Session, AuthError> {
        let status = response.status;
        if status.is_success() {
            let fields: SessionFields = response.json()?;
            return Session::try_from(fields);
        }

        let body = truncate_body(&response.text());
        if status.is_client_error() {
            warn!(exchange, status = status.as_u16(), body = %body, "Exchange rejected");
            Err(rejected)
        } else {
            warn!(exchange, status = status.as_u16(), body = %body, "Exchange failed");
            Err(AuthError::ServerUnavailable(format!(
                "{} exchange returned {}",
                exchange, status
            )))
        }
    }
}
