//! Login form controller.
//!
//! Holds the two text fields of the login form, publishes an observable
//! `LoginViewState` for the presentation layer, and turns a submit action
//! into one login exchange whose session is written to the store.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::AuthError;
use crate::exchange::ExchangeClient;
use crate::session::{Credentials, Session};
use crate::store::SessionStore;
use crate::validation::{PasswordValidationState, UserDataValidator};

/// Editable text held by the form.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TextField {
    text: String,
}

impl TextField {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn edit(&mut self, f: impl FnOnce(&mut String)) {
        f(&mut self.text);
    }
}

impl fmt::Debug for TextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextField({} chars)", self.text.chars().count())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoginViewState {
    pub email: TextField,
    pub password: TextField,
    pub is_email_valid: bool,
    pub password_requirements: PasswordValidationState,
    pub can_submit: bool,
    pub is_logging_in: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginAction {
    Submit,
    DismissError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    LoggedIn(Session),
    Failed(AuthError),
    /// The form was not submittable or a login was already outstanding.
    Ignored,
}

/// Turn an auth error into the message shown inline on the form.
pub fn user_message(err: &AuthError) -> String {
    match err {
        AuthError::InvalidCredentials => "Invalid email or password".to_string(),
        AuthError::ServerUnavailable(_) => {
            "Unable to reach the server. Please try again.".to_string()
        }
        other => format!("Login failed: {}", other),
    }
}

pub struct LoginController {
    exchange: Arc<ExchangeClient>,
    store: Arc<SessionStore>,
    validator: UserDataValidator,
    state: watch::Sender<LoginViewState>,
    submitting: AtomicBool,
}

/// Releases the re-entrancy guard even if the submit future is dropped.
struct SubmitGuard<'a> {
    controller: &'a LoginController,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.controller.update(|s| s.is_logging_in = false);
        self.controller.submitting.store(false, Ordering::SeqCst);
    }
}

impl LoginController {
    pub fn new(
        exchange: Arc<ExchangeClient>,
        store: Arc<SessionStore>,
        validator: UserDataValidator,
    ) -> Self {
        let (state, _) = watch::channel(LoginViewState::default());
        Self {
            exchange,
            store,
            validator,
            state,
            submitting: AtomicBool::new(false),
        }
    }

    /// Current form state.
    pub fn state(&self) -> LoginViewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoginViewState> {
        self.state.subscribe()
    }

    pub fn edit_email(&self, f: impl FnOnce(&mut String)) {
        self.update(|s| {
            s.email.edit(f);
            s.error = None;
        });
    }

    pub fn edit_password(&self, f: impl FnOnce(&mut String)) {
        self.update(|s| {
            s.password.edit(f);
            s.error = None;
        });
    }

    pub async fn on_action(&self, action: LoginAction) -> SubmitOutcome {
        match action {
            LoginAction::Submit => self.submit().await,
            LoginAction::DismissError => {
                self.update(|s| s.error = None);
                SubmitOutcome::Ignored
            }
        }
    }

    /// Run one login exchange with the current field values.
    ///
    /// Ignored unless the form is submittable and no login is outstanding.
    pub async fn submit(&self) -> SubmitOutcome {
        let snapshot = self.state();
        if !snapshot.can_submit {
            debug!("Submit ignored, form is not submittable");
            return SubmitOutcome::Ignored;
        }
        if self
            .submitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Submit ignored, login already in progress");
            return SubmitOutcome::Ignored;
        }
        let _guard = SubmitGuard { controller: self };

        self.update(|s| {
            s.is_logging_in = true;
            s.error = None;
        });

        let credentials = Credentials::new(snapshot.email.text().trim(), snapshot.password.text());
        let result = match self.exchange.login(&credentials).await {
            Ok(session) => self
                .store
                .set(session.clone())
                .map(|()| session)
                .map_err(AuthError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(session) => {
                info!(user_id = %session.user_id(), "Login successful");
                SubmitOutcome::LoggedIn(session)
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                let message = user_message(&e);
                self.update(|s| s.error = Some(message));
                SubmitOutcome::Failed(e)
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut LoginViewState)) {
        self.state.send_modify(|s| {
            f(s);
            s.is_email_valid = self.validator.is_valid_email(s.email.text());
            s.password_requirements = self.validator.validate_password(s.password.text());
            s.can_submit =
                s.is_email_valid && s.password_requirements.is_valid() && !s.is_logging_in;
        });
    }
}
