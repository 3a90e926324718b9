//! In-process transports and backends for unit tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;

use crate::error::{StoreError, TransportError};
use crate::http::{HttpRequest, HttpResponse, StatusCode, Transport};
use crate::store::{MemoryPersistence, SessionPersistence};

type Handler =
    Box<dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, TransportError>> + Send + Sync>;

/// Answers every request through a closure and records the request history.
pub(crate) struct ScriptedTransport {
    handler: Handler,
    history: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new<F, Fut>(handler: F) -> Arc<Self>
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, TransportError>> + Send + 'static,
    {
        Arc::new(Self {
            handler: Box::new(move |request| handler(request).boxed()),
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        (self.handler)(request).await
    }
}

pub(crate) fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::new(status, body.to_string())
}

pub(crate) fn session_body(user_id: &str, access: &str, refresh: &str) -> serde_json::Value {
    json!({
        "userId": user_id,
        "accessToken": access,
        "refreshToken": refresh,
    })
}

pub const LOGIN_PATH: &str = "/login";
pub const REFRESH_PATH: &str = "/accessToken";
pub const API_KEY: &str = "test-api-key";

/// Minimal auth server: `/login` issues current-generation tokens, `/accessToken`
/// rotates to the next generation, every other path demands the current
/// access token.
pub(crate) struct FakeAuthServer {
    generation: AtomicU32,
    refresh_status: AtomicU16,
    refresh_delay: Duration,
}

impl FakeAuthServer {
    /// Server whose currently valid access token is `a{generation}`.
    pub fn new(generation: u32, refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            generation: AtomicU32::new(generation),
            refresh_status: AtomicU16::new(200),
            refresh_delay,
        })
    }

    /// Make the refresh endpoint answer with `status` instead of rotating.
    pub fn fail_refresh_with(&self, status: u16) {
        self.refresh_status.store(status, Ordering::SeqCst);
    }

    pub fn valid_token(&self) -> String {
        format!("a{}", self.generation.load(Ordering::SeqCst))
    }

    pub fn transport(self: &Arc<Self>) -> Arc<ScriptedTransport> {
        let server = self.clone();
        ScriptedTransport::new(move |request| {
            let server = server.clone();
            async move { Ok(server.handle(request).await) }
        })
    }

    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        match request.path.as_str() {
            LOGIN_PATH => {
                let n = self.generation.load(Ordering::SeqCst);
                json_response(200, session_body("u1", &format!("a{n}"), &format!("r{n}")))
            }
            REFRESH_PATH => {
                tokio::time::sleep(self.refresh_delay).await;
                let status = self.refresh_status.load(Ordering::SeqCst);
                if status != 200 {
                    return json_response(status, json!({"error": "refresh rejected"}));
                }
                let n = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                json_response(200, session_body("u1", &format!("a{n}"), &format!("r{n}")))
            }
            _ => {
                if request.bearer_token() == Some(self.valid_token().as_str()) {
                    json_response(200, json!({"path": request.path}))
                } else {
                    json_response(401, json!({"error": "unauthorized"}))
                }
            }
        }
    }
}

/// Memory backend whose loads and writes can be made to fail.
pub(crate) struct FailingPersistence {
    inner: MemoryPersistence,
    fail_writes: AtomicBool,
    load_error: Mutex<Option<StoreError>>,
}

impl FailingPersistence {
    pub fn new() -> Self {
        Self {
            inner: MemoryPersistence::new(),
            fail_writes: AtomicBool::new(false),
            load_error: Mutex::new(None),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, error: Option<StoreError>) {
        *self.load_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

impl SessionPersistence for FailingPersistence {
    fn load(&self) -> Result<Option<String>, StoreError> {
        if let Some(e) = self.load_error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(e);
        }
        self.inner.load()
    }

    fn save(&self, blob: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".into()));
        }
        self.inner.save(blob)
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("read-only".into()));
        }
        self.inner.clear()
    }
}
