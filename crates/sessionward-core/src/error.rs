use thiserror::Error;

/// Failures of the session lifecycle, as seen by callers of the exchange
/// client, the refresh coordinator and the auth pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl AuthError {
    /// Whether this error ends the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::SessionExpired)
    }
}

/// Failures of the persistence collaborator behind the session store.
///
/// Kept `Clone` so a single refresh outcome can be fanned out to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Corrupted session data: {0}")]
    Corrupted(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Failure to get any HTTP response at all.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TransportError> for AuthError {
    fn from(err: TransportError) -> Self {
        AuthError::ServerUnavailable(err.to_string())
    }
}

/// Maximum length for error response bodies in log messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_short() {
        assert_eq!(truncate_body("bad request"), "bad request");
    }

    #[test]
    fn test_truncate_body_long() {
        let body = "x".repeat(600);
        let truncated = truncate_body(&body);
        assert!(truncated.starts_with(&"x".repeat(500)));
        assert!(truncated.ends_with("(truncated, 600 total bytes)"));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(400);
        // Must not panic on a multi-byte boundary
        let truncated = truncate_body(&body);
        assert!(truncated.contains("800 total bytes"));
    }

    #[test]
    fn test_only_session_expired_is_terminal() {
        assert!(AuthError::SessionExpired.is_terminal());
        assert!(!AuthError::InvalidCredentials.is_terminal());
        assert!(!AuthError::NotLoggedIn.is_terminal());
        assert!(!AuthError::ServerUnavailable("down".into()).is_terminal());
    }
}
