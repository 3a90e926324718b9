//! Authenticated request pipeline.
//!
//! Every outbound call except the exchange calls passes through
//! `AuthPipeline::send`, which attaches the API key and the current access
//! token. A 401 on an authenticated request triggers one coordinated refresh
//! and exactly one resend; every other response is returned untouched.

use std::sync::Arc;

use reqwest::header::{self, HeaderValue};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::exchange::ApiKey;
use crate::http::{HttpRequest, HttpResponse, StatusCode, Transport};
use crate::refresh::RefreshCoordinator;
use crate::session::Session;
use crate::store::SessionStore;

pub struct AuthPipeline {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    api_key: ApiKey,
}

impl AuthPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
        api_key: ApiKey,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
            api_key,
        }
    }

    /// Send `request` with the current credentials attached.
    ///
    /// Retries at most once, and only for a 401 on a request that carried an
    /// access token. Refresh failures are returned instead of the 401.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        let session = self.store.get();
        let request = self.authorize(request, session.as_ref())?;

        let response = self.dispatch(request.clone()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(rejected) = request.bearer_token().map(str::to_owned) else {
            debug!(path = %request.path, "Unauthorized without a session, nothing to refresh");
            return Ok(response);
        };

        info!(path = %request.path, "Access token rejected, refreshing session");
        let refreshed = self.coordinator.refresh_after_rejection(&rejected).await?;

        let path = request.path.clone();
        let retry = self.authorize(request, Some(&refreshed))?;
        let response = self.dispatch(retry).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            warn!(%path, "Still unauthorized after refresh, giving up");
        }
        Ok(response)
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, AuthError> {
        self.send(HttpRequest::get(path)).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HttpResponse, AuthError> {
        self.send(HttpRequest::post(path).json(body)?).await
    }

    /// Attach the API key and, when there is a session, the bearer header.
    /// Without a session any caller-supplied `Authorization` is stripped.
    fn authorize(
        &self,
        request: HttpRequest,
        session: Option<&Session>,
    ) -> Result<HttpRequest, AuthError> {
        let mut request = self.api_key.apply(request);
        match session {
            Some(session) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", session.access_token()))
                    .map_err(|_| {
                        AuthError::InvalidResponse("access token is not a valid header value".into())
                    })?;
                value.set_sensitive(true);
                request.headers.insert(header::AUTHORIZATION, value);
            }
            None => {
                request.headers.remove(header::AUTHORIZATION);
            }
        }
        Ok(request)
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        let method = request.method.clone();
        let path = request.path.clone();

        match self.transport.send(request).await {
            Ok(response) => {
                debug!(%method, %path, status = response.status.as_u16(), "Request completed");
                Ok(response)
            }
            Err(e) => {
                warn!(%method, %path, error = %e, "Request failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::exchange::{ExchangeClient, ExchangeEndpoints};
    use crate::http::API_KEY_HEADER;
    use crate::testing::{
        json_response, session_body, FakeAuthServer, ScriptedTransport, API_KEY, REFRESH_PATH,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pipeline(
        transport: Arc<ScriptedTransport>,
        session: Option<Session>,
    ) -> (Arc<AuthPipeline>, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::in_memory());
        if let Some(session) = session {
            store.set(session).unwrap();
        }
        let api_key = ApiKey::new(API_KEY).unwrap();
        let exchange = Arc::new(ExchangeClient::new(
            transport.clone(),
            api_key.clone(),
            ExchangeEndpoints::default(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange));
        let pipeline = Arc::new(AuthPipeline::new(transport, store.clone(), coordinator, api_key));
        (pipeline, store)
    }

    /// Session one rotation behind a `FakeAuthServer` at generation 1.
    fn stale() -> Session {
        Session::new("u1", "a0", "r0").unwrap()
    }

    #[tokio::test]
    async fn test_no_session_sends_api_key_only() {
        let server = FakeAuthServer::new(1, Duration::ZERO);
        let transport = server.transport();
        let (pipeline, _store) = pipeline(transport.clone(), None);

        let request = HttpRequest::get("/runs").header(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer smuggled"),
        );
        let response = pipeline.send(request).await.unwrap();

        // 401 without a session passes through, no refresh attempted
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.get(API_KEY_HEADER).unwrap(), API_KEY);
        assert!(sent[0].headers.get(header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_session_attaches_bearer_token() {
        let server = FakeAuthServer::new(1, Duration::ZERO);
        let transport = server.transport();
        let fresh = Session::new("u1", "a1", "r1").unwrap();
        let (pipeline, _store) = pipeline(transport.clone(), Some(fresh));

        let response = pipeline.get("/runs").await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.requests()[0].bearer_token(), Some("a1"));
        assert_eq!(transport.count(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_retries_once() {
        let server = FakeAuthServer::new(1, Duration::ZERO);
        let transport = server.transport();
        let (pipeline, store) = pipeline(transport.clone(), Some(stale()));

        let response = pipeline
            .post_json("/runs", &json!({"distance": 5}))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        let runs = transport.requests_to("/runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].bearer_token(), Some("a0"));
        assert_eq!(runs[1].bearer_token(), Some("a2"));
        // Body survives the retry
        assert_eq!(runs[1].body, runs[0].body);
        assert_eq!(transport.count(REFRESH_PATH), 1);
        assert_eq!(store.get().unwrap().access_token(), "a2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_unauthorized_requests_share_one_refresh() {
        let server = FakeAuthServer::new(1, Duration::from_millis(100));
        let transport = server.transport();
        let (pipeline, _store) = pipeline(transport.clone(), Some(stale()));

        let requests: Vec<_> = (0..20)
            .map(|i| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.get(&format!("/runs/{i}")).await })
            })
            .collect();

        for result in futures::future::join_all(requests).await {
            assert_eq!(result.unwrap().unwrap().status, StatusCode::OK);
        }
        assert_eq!(transport.count(REFRESH_PATH), 1);

        let retries: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.path.starts_with("/runs/") && r.bearer_token() == Some("a2"))
            .collect();
        assert_eq!(retries.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_staggered_unauthorized_requests_share_one_refresh() {
        // Slow API: the last stale 401s arrive after the refresh has finished
        let server = FakeAuthServer::new(1, Duration::from_millis(10));
        let inner = server.transport();
        let transport = ScriptedTransport::new(move |request: HttpRequest| {
            let inner = inner.clone();
            async move {
                if let Some(n) = request.path.strip_prefix("/runs/") {
                    let n: u64 = n.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(n * 10)).await;
                }
                inner.send(request).await
            }
        });
        let (pipeline, _store) = pipeline(transport.clone(), Some(stale()));

        let requests: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.get(&format!("/runs/{i}")).await })
            })
            .collect();

        for result in futures::future::join_all(requests).await {
            assert_eq!(result.unwrap().unwrap().status, StatusCode::OK);
        }
        assert_eq!(transport.count(REFRESH_PATH), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_refresh_fails_all_and_logs_out() {
        let server = FakeAuthServer::new(1, Duration::from_millis(50));
        server.fail_refresh_with(401);
        let transport = server.transport();
        let (pipeline, store) = pipeline(transport.clone(), Some(stale()));

        let requests: Vec<_> = (0..10)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.get("/runs").await })
            })
            .collect();

        for result in futures::future::join_all(requests).await {
            assert_eq!(result.unwrap().unwrap_err(), AuthError::SessionExpired);
        }
        assert_eq!(transport.count(REFRESH_PATH), 1);
        // No resend after a failed refresh
        assert_eq!(transport.count("/runs"), 10);
        assert_eq!(store.get(), None);

        pipeline.get("/runs").await.unwrap();
        let last = transport.requests().pop().unwrap();
        assert!(last.headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(last.headers.get(API_KEY_HEADER).unwrap(), API_KEY);
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_returned_without_another_retry() {
        let transport = ScriptedTransport::new(|request: HttpRequest| async move {
            Ok(if request.path == REFRESH_PATH {
                json_response(200, session_body("u1", "a1", "r1"))
            } else {
                json_response(401, json!({"error": "forbidden forever"}))
            })
        });
        let (pipeline, _store) = pipeline(transport.clone(), Some(stale()));

        let response = pipeline.get("/runs").await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(transport.count("/runs"), 2);
        assert_eq!(transport.count(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let transport = ScriptedTransport::new(|request: HttpRequest| async move {
            Ok(match request.path.as_str() {
                "/missing" => json_response(404, json!({"error": "not found"})),
                "/forbidden" => json_response(403, json!({"error": "forbidden"})),
                _ => json_response(500, json!({"error": "boom"})),
            })
        });
        let (pipeline, _store) = pipeline(transport.clone(), Some(stale()));

        let missing = pipeline.get("/missing").await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.json::<serde_json::Value>().unwrap()["error"], "not found");
        assert_eq!(
            pipeline.get("/forbidden").await.unwrap().status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            pipeline.get("/boom").await.unwrap().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(transport.count(REFRESH_PATH), 0);
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_failure_on_retry_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = {
            let calls = calls.clone();
            ScriptedTransport::new(move |request: HttpRequest| {
                let calls = calls.clone();
                async move {
                    if request.path == REFRESH_PATH {
                        return Ok(json_response(200, session_body("u1", "a1", "r1")));
                    }
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(json_response(401, json!({})))
                    } else {
                        Err(TransportError::Timeout("/runs".into()))
                    }
                }
            })
        };
        let (pipeline, _store) = pipeline(transport.clone(), Some(stale()));

        let err = pipeline.get("/runs").await.unwrap_err();

        assert!(matches!(err, AuthError::ServerUnavailable(_)));
        assert_eq!(transport.count("/runs"), 2);
    }
}
