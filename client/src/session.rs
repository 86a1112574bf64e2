//! Current-session provider.

use crate::transport::RequestOptions;
use parking_lot::RwLock;

/// Supplies the auth token attached to outgoing requests when the caller
/// does not pass one.
pub trait SessionProvider: Send + Sync {
    fn session_token(&self) -> Option<String>;
}

/// No session; requests carry only explicitly passed tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSession;

impl SessionProvider for NoSession {
    fn session_token(&self) -> Option<String> {
        None
    }
}

/// A session whose token can be swapped at runtime, e.g. on login.
#[derive(Debug, Default)]
pub struct CurrentSession {
    token: RwLock<Option<String>>,
}

impl CurrentSession {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl SessionProvider for CurrentSession {
    fn session_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Request options for a call: the explicit token, or the provider's.
pub fn request_options(explicit: Option<&str>, provider: &dyn SessionProvider) -> RequestOptions {
    RequestOptions {
        session_token: explicit
            .map(str::to_string)
            .or_else(|| provider.session_token()),
    }
}
