//! Remote store capability.
//!
//! The backing service is a shared relational store exposing per-collection
//! select / batched upsert / delete. This module defines the consumed
//! interface and its error taxonomy; the HTTP client lives in a separate
//! crate.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::store::Collection;

/// Row filter for select/delete calls. Single-clause: every scope the engine
/// needs is either unfiltered, an equality, or an id-set membership test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every row the caller's identity can see.
    All,
    /// `column = value`
    Eq(&'static str, String),
    /// `column IN (values)`
    AnyOf(&'static str, Vec<String>),
}

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors produced by a [`RemoteStore`] implementation.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure: unreachable host, timeout, dropped body.
    #[error("remote store unreachable: {0}")]
    Transport(String),

    /// Error response from the remote API.
    #[error("remote API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Missing or rejected credentials.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Response body did not parse as the expected shape.
    #[error("malformed remote payload: {0}")]
    Payload(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify for retry policy. The sync engine treats every class the same
    /// way (retry on the next pass); callers that can reauthenticate use
    /// [`RemoteRetryClass::ReauthRequired`] as a signal.
    pub fn retry_class(&self) -> RemoteRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => RemoteRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => RemoteRetryClass::Retryable,
                500..=599 => RemoteRetryClass::Retryable,
                _ => RemoteRetryClass::Permanent,
            },
            Self::Transport(_) => RemoteRetryClass::Retryable,
            Self::Auth(_) => RemoteRetryClass::ReauthRequired,
            Self::Payload(_) => RemoteRetryClass::Permanent,
        }
    }
}

/// Per-collection access to the shared remote store.
///
/// `upsert` must return the stored rows (with server-assigned ids) in input
/// order; the engine maps returned ids back to uploaded records positionally.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(
        &self,
        token: &str,
        collection: Collection,
        filter: Filter,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn upsert(
        &self,
        token: &str,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn delete(
        &self,
        token: &str,
        collection: Collection,
        filter: Filter,
    ) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_matches_status_table() {
        assert_eq!(
            RemoteError::api(500, "boom").retry_class(),
            RemoteRetryClass::Retryable
        );
        assert_eq!(
            RemoteError::api(429, "slow down").retry_class(),
            RemoteRetryClass::Retryable
        );
        assert_eq!(
            RemoteError::api(401, "expired").retry_class(),
            RemoteRetryClass::ReauthRequired
        );
        assert_eq!(
            RemoteError::api(400, "bad row").retry_class(),
            RemoteRetryClass::Permanent
        );
        assert_eq!(
            RemoteError::Transport("refused".into()).retry_class(),
            RemoteRetryClass::Retryable
        );
    }
}
