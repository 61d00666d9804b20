//! Request decoration by an authentication provider.

use std::fmt;

/// The provider could not produce credentials (expired refresh token,
/// missing certificate, ...). Surfaces to callers as `Unauthorized`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication failed: {0}")]
pub struct AuthError(pub String);

/// Adds credentials to the headers of every outgoing attempt.
///
/// Called once per attempt, so a provider that refreshes tokens is
/// consulted again before a retry.
pub trait AuthProvider: Send + Sync {
    fn decorate(&self, headers: &mut Vec<(String, String)>) -> Result<(), AuthError>;
}

impl<F> AuthProvider for F
where
    F: Fn(&mut Vec<(String, String)>) -> Result<(), AuthError> + Send + Sync,
{
    fn decorate(&self, headers: &mut Vec<(String, String)>) -> Result<(), AuthError> {
        self(headers)
    }
}

/// A fixed bearer token.
#[derive(Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken").field("token", &"<redacted>").finish()
    }
}

impl AuthProvider for BearerToken {
    fn decorate(&self, headers: &mut Vec<(String, String)>) -> Result<(), AuthError> {
        if self.token.is_empty() {
            return Err(AuthError("bearer token is empty".to_string()));
        }
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
        headers.push(("authorization".to_string(), format!("Bearer {}", self.token)));
        Ok(())
    }
}
