//! Identity signal: present / absent / unknown, tolerant of refresh blips.
//!
//! DESIGN
//! ======
//! The provider may push a sign-out for a moment while it refreshes a token.
//! Each sign-in stamps `auth:last_authenticated_at` in the local store; a
//! sign-out arriving inside `transient_null_grace` of that stamp is deferred
//! until the window closes, when the owner re-reads the provider and calls
//! `confirm_signed_out` if it still reports no session. A sign-out outside the
//! window is real.

pub mod bypass;
pub mod provider;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};

use crate::store::{LAST_AUTHENTICATED_KEY, LocalStore};
use provider::{ProviderEvent, ProviderSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Unknown,
    Present,
    Absent,
}

impl IdentityStatus {
    #[must_use]
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Provider-asserted session. Replaced wholesale on every push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub status: IdentityStatus,
    pub identity_id: Option<String>,
}

impl Session {
    #[must_use]
    pub fn unknown() -> Self {
        Self { status: IdentityStatus::Unknown, identity_id: None }
    }

    #[must_use]
    pub fn absent() -> Self {
        Self { status: IdentityStatus::Absent, identity_id: None }
    }

    #[must_use]
    pub fn present(identity_id: &str) -> Self {
        Self { status: IdentityStatus::Present, identity_id: Some(identity_id.to_string()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Unchanged,
    BecamePresent { identity_id: String },
    /// Present before and after, but a different identity.
    IdentityChanged { identity_id: String },
    BecameAbsent,
    /// Sign-out held back by the transient window; re-check the provider after `recheck_in`.
    SignOutDeferred { recheck_in: Duration },
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub struct IdentitySignal {
    session: Session,
    credentials: Option<ProviderSession>,
    store: Arc<dyn LocalStore>,
    transient_null_grace: Duration,
}

impl IdentitySignal {
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>, transient_null_grace: Duration) -> Self {
        Self { session: Session::unknown(), credentials: None, store, transient_null_grace }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn status(&self) -> IdentityStatus {
        self.session.status
    }

    /// Credentials for backend calls while present.
    #[must_use]
    pub fn credentials(&self) -> Option<&ProviderSession> {
        self.credentials.as_ref()
    }

    /// Apply one provider push.
    pub fn apply(&mut self, event: &ProviderEvent, now_ms: i64) -> SessionTransition {
        match event {
            ProviderEvent::SignedIn(session) => {
                self.store
                    .set(LAST_AUTHENTICATED_KEY, &now_ms.to_string());
                let previous = self.session.clone();
                self.session = Session::present(&session.identity_id);
                self.credentials = Some(session.clone());
                match (previous.status, previous.identity_id) {
                    (IdentityStatus::Present, Some(prev)) if prev == session.identity_id => {
                        SessionTransition::Unchanged
                    }
                    (IdentityStatus::Present, _) => {
                        info!(identity_id = %session.identity_id, "identity changed");
                        SessionTransition::IdentityChanged { identity_id: session.identity_id.clone() }
                    }
                    _ => {
                        info!(identity_id = %session.identity_id, "identity present");
                        SessionTransition::BecamePresent { identity_id: session.identity_id.clone() }
                    }
                }
            }
            ProviderEvent::SignedOut => {
                if self.session.status == IdentityStatus::Absent {
                    return SessionTransition::Unchanged;
                }
                if self.session.status == IdentityStatus::Present {
                    if let Some(recheck_in) = self.transient_window_remaining(now_ms) {
                        debug!(recheck_in = ?recheck_in, "transient sign-out inside grace window; deferring");
                        return SessionTransition::SignOutDeferred { recheck_in };
                    }
                }
                info!("identity absent");
                self.session = Session::absent();
                self.credentials = None;
                SessionTransition::BecameAbsent
            }
        }
    }

    /// Apply a deferred sign-out once the provider still reports no session.
    pub fn confirm_signed_out(&mut self) -> bool {
        if self.session.status != IdentityStatus::Present {
            return false;
        }
        info!("identity absent after transient window");
        self.session = Session::absent();
        self.credentials = None;
        true
    }

    /// Whether the last sign-in stamp lies inside the transient-null window.
    #[must_use]
    pub fn recently_authenticated(&self, now_ms: i64) -> bool {
        self.transient_window_remaining(now_ms).is_some()
    }

    fn transient_window_remaining(&self, now_ms: i64) -> Option<Duration> {
        if self.transient_null_grace.is_zero() {
            return None;
        }
        let stamp = self
            .store
            .get(LAST_AUTHENTICATED_KEY)
            .and_then(|raw| raw.parse::<i64>().ok())?;
        let window = i64::try_from(self.transient_null_grace.as_millis()).unwrap_or(i64::MAX);
        let elapsed = now_ms.saturating_sub(stamp);
        if !(0..=window).contains(&elapsed) {
            return None;
        }
        Some(Duration::from_millis(u64::try_from(window - elapsed).unwrap_or(0)))
    }

    /// Resolve an unknown session to absent. No-op once known.
    pub fn resolve_unauthenticated(&mut self) -> bool {
        if self.session.status != IdentityStatus::Unknown {
            return false;
        }
        self.session = Session::absent();
        self.credentials = None;
        true
    }

    /// Logout: back to unknown, stamp removed so no grace applies.
    pub fn reset(&mut self) {
        self.session = Session::unknown();
        self.credentials = None;
        self.store.remove(LAST_AUTHENTICATED_KEY);
    }

    /// Replace credentials after a token refresh for the same identity.
    pub fn refresh_credentials(&mut self, session: ProviderSession) {
        if self.session.identity_id.as_deref() == Some(session.identity_id.as_str()) {
            self.credentials = Some(session);
        }
    }
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
