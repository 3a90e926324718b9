//! Credential syntax rules that gate the login form's submit action.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Minimum number of characters in a password
pub const MIN_PASSWORD_LENGTH: usize = 9;

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9+._%\-]{1,256}@[a-zA-Z0-9][a-zA-Z0-9\-]{0,64}(\.[a-zA-Z0-9][a-zA-Z0-9\-]{0,25})+$";

pub trait PatternValidator: Send + Sync {
    fn matches(&self, value: &str) -> bool;
}

/// Accepts ordinary `local@domain.tld` addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailPatternValidator;

impl PatternValidator for EmailPatternValidator {
    fn matches(&self, value: &str) -> bool {
        static EMAIL: OnceLock<Regex> = OnceLock::new();
        EMAIL
            .get_or_init(|| Regex::new(EMAIL_PATTERN).expect("email pattern is a valid regex"))
            .is_match(value)
    }
}

/// Which password rules a candidate satisfies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PasswordValidationState {
    pub has_min_length: bool,
    pub has_number: bool,
    pub has_lower_case: bool,
    pub has_upper_case: bool,
}

impl PasswordValidationState {
    pub fn is_valid(&self) -> bool {
        self.has_min_length && self.has_number && self.has_lower_case && self.has_upper_case
    }
}

pub struct UserDataValidator {
    pattern: Box<dyn PatternValidator>,
}

impl UserDataValidator {
    pub fn new(pattern: impl PatternValidator + 'static) -> Self {
        Self {
            pattern: Box::new(pattern),
        }
    }

    pub fn is_valid_email(&self, email: &str) -> bool {
        self.pattern.matches(email.trim())
    }

    pub fn validate_password(&self, password: &str) -> PasswordValidationState {
        PasswordValidationState {
            has_min_length: password.chars().count() >= MIN_PASSWORD_LENGTH,
            has_number: password.chars().any(|c| c.is_ascii_digit()),
            has_lower_case: password.chars().any(char::is_lowercase),
            has_upper_case: password.chars().any(char::is_uppercase),
        }
    }
}

impl Default for UserDataValidator {
    fn default() -> Self {
        Self::new(EmailPatternValidator)
    }
}
