use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// An authenticated user: identity plus the two opaque tokens.
///
/// A `Session` is never partially updated; a login or refresh produces a new
/// value that replaces the old one. All three fields are non-empty, absence of
/// a session is modelled as `Option<Session>::None`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SessionFields", into = "SessionFields")]
pub struct Session {
    user_id: String,
    access_token: String,
    refresh_token: String,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let session = Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        };

        let missing = [
            ("userId", &session.user_id),
            ("accessToken", &session.access_token),
            ("refreshToken", &session.refresh_token),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        match missing {
            Some((field, _)) => Err(AuthError::InvalidResponse(format!("empty {}", field))),
            None => Ok(session),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Wire shape shared by the login and refresh responses and the persisted blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionFields {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

impl TryFrom<SessionFields> for Session {
    type Error = AuthError;

    fn try_from(fields: SessionFields) -> Result<Self, Self::Error> {
        Session::new(fields.user_id, fields.access_token, fields.refresh_token)
    }
}

impl From<Session> for SessionFields {
    fn from(session: Session) -> Self {
        Self {
            user_id: session.user_id,
            access_token: session.access_token,
            refresh_token: session.refresh_token,
        }
    }
}

/// Raw login input. Lives only for the duration of a login call.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The blob handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    #[serde(flatten)]
    pub session: Session,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSession {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            saved_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.saved_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

/// Change notifications published by the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionEvent {
    LoggedIn { user_id: String },
    Refreshed { user_id: String },
    LoggedOut,
    /// The refresh token was rejected; the presentation layer should force a logout.
    Expired,
}
