//! Rate limit key derivation.

use std::fmt;

use crate::error::{LoginGuardError, Result};

/// Action name used for login attempts.
pub const LOGIN_ACTION: &str = "login";

/// A key that identifies a rate limited subject and action.
///
/// Rendered as `<action>:<identity>`. The action is lowercased and both
/// parts are trimmed, so the same subject always lands on the same counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    rendered: String,
    action_len: usize,
}

impl RateLimitKey {
    /// Create a key for `identity` performing `action`.
    pub fn new(action: &str, identity: &str) -> Result<Self> {
        let action = action.trim().to_lowercase();
        let identity = identity.trim();

        if action.is_empty() {
            return Err(LoginGuardError::InvalidKey("action must not be empty".into()));
        }
        if action.contains(':') {
            return Err(LoginGuardError::InvalidKey(format!(
                "action must not contain ':': {}",
                action
            )));
        }
        if identity.is_empty() {
            return Err(LoginGuardError::InvalidKey("identity must not be empty".into()));
        }

        Ok(Self {
            action_len: action.len(),
            rendered: format!("{}:{}", action, identity),
        })
    }

    /// Key for login attempts against an email address.
    ///
    /// Email addresses are compared case-insensitively.
    pub fn login(email: &str) -> Result<Self> {
        Self::new(LOGIN_ACTION, &email.trim().to_lowercase())
    }

    pub fn action(&self) -> &str {
        &self.rendered[..self.action_len]
    }

    pub fn identity(&self) -> &str {
        &self.rendered[self.action_len + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}
