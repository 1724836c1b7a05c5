//! Session provider capability.
//!
//! The core only consumes `get_session()`; acquiring and refreshing tokens is
//! someone else's job. A `None` session means "operate offline": no remote
//! call is attempted anywhere in the crate.

use async_trait::async_trait;

/// Current authenticated identity plus its cached access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
}

/// Supplies the current authenticated session, if any.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self) -> Option<AuthSession>;
}

/// Fixed-session provider for tests and single-identity deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionProvider {
    session: Option<AuthSession>,
}

impl StaticSessionProvider {
    pub fn signed_in(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            session: Some(AuthSession {
                user_id: user_id.into(),
                token: token.into(),
            }),
        }
    }

    pub fn signed_out() -> Self {
        Self { session: None }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn get_session(&self) -> Option<AuthSession> {
        self.session.clone()
    }
}
