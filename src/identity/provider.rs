//! Identity provider seam.
//!
//! The real provider (hosted auth SDK) lives outside this crate. The gate
//! only needs its three capabilities: a change stream, a point-in-time read
//! and a token refresh. [`PushIdentityProvider`] is the in-process bridge
//! the embedding shell feeds, one push per provider callback.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorCode;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Credentials asserted by the provider for one signed-in visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub identity_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SignedIn(ProviderSession),
    /// May be transient while the provider refreshes a token.
    SignedOut,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

impl ErrorCode for IdentityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_IDENTITY_UNAVAILABLE",
            Self::Refresh(_) => "E_IDENTITY_REFRESH",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Subscribe to session pushes. Each call returns an independent receiver.
    fn on_session_change(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Current session, or `None` when signed out or not yet known.
    async fn current_session(&self) -> Result<Option<ProviderSession>, IdentityError>;

    /// Ask the provider for fresh credentials.
    async fn refresh_token(&self) -> Result<Option<ProviderSession>, IdentityError>;
}

// =============================================================================
// PUSH BRIDGE
// =============================================================================

pub struct PushIdentityProvider {
    tx: broadcast::Sender<ProviderEvent>,
    /// `None` until the first push.
    latest: Mutex<Option<Option<ProviderSession>>>,
}

impl PushIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx, latest: Mutex::new(None) }
    }

    /// Forward one provider callback to every subscriber.
    pub fn push(&self, event: ProviderEvent) {
        let snapshot = match &event {
            ProviderEvent::SignedIn(session) => Some(session.clone()),
            ProviderEvent::SignedOut => None,
        };
        *self
            .latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(snapshot);
        // No subscribers yet is fine; `current_session` still sees the push.
        let _ = self.tx.send(event);
    }

    fn snapshot(&self) -> Option<ProviderSession> {
        self.latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .flatten()
    }
}

impl Default for PushIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for PushIdentityProvider {
    fn on_session_change(&self) -> broadcast::Receiver<ProviderEvent> {
        self.tx.subscribe()
    }

    async fn current_session(&self) -> Result<Option<ProviderSession>, IdentityError> {
        Ok(self.snapshot())
    }

    async fn refresh_token(&self) -> Result<Option<ProviderSession>, IdentityError> {
        Ok(self.snapshot())
    }
}
