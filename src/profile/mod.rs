//! Profile hydration: backend roles, current role, onboarding flag.
//!
//! DESIGN
//! ======
//! [`ProfileHydrator`] is a synchronous state machine; the async fetch runs
//! outside it and reports back through [`ProfileHydrator::complete`]. Each
//! fetch gets a [`FetchTicket`] carrying a monotonically increasing sequence,
//! the identity it was issued for, and the hydrator epoch.
//!
//! ORDERING
//! ========
//! Responses apply by sequence, not arrival: a completion older than the
//! last applied one is dropped, as is any completion issued before the last
//! `invalidate` (logout / identity flip). Hydration is terminal only once the
//! newest issued sequence has reported.

pub mod api;

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::identity::provider::ProviderSession;
use crate::roles::Capability;
use api::{ProfileApi, ProfileResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HydrationError {
    #[error("profile request failed: {0}")]
    Transient(String),
    #[error("profile request unauthorized")]
    Unauthorized,
    #[error("profile request rejected: status {status}")]
    Rejected { status: u16, body: String },
    #[error("profile response parse failed: {0}")]
    Parse(String),
    #[error("profile hydration timed out")]
    TimedOut,
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ErrorCode for HydrationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "E_PROFILE_TRANSIENT",
            Self::Unauthorized => "E_PROFILE_UNAUTHORIZED",
            Self::Rejected { .. } => "E_PROFILE_REJECTED",
            Self::Parse(_) => "E_PROFILE_PARSE",
            Self::TimedOut => "E_PROFILE_TIMED_OUT",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Backend-owned user profile. Read-only outside the hydrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub roles: BTreeSet<String>,
    pub current_role: Option<String>,
    pub is_onboarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}

impl Profile {
    #[must_use]
    pub fn from_response(user_id: &str, resp: ProfileResponse) -> Self {
        Self {
            user_id: user_id.to_string(),
            roles: resp
                .roles
                .into_iter()
                .filter(|r| !r.trim().is_empty())
                .collect(),
            current_role: resp.current_role,
            is_onboarded: resp.is_onboarded,
            venue: resp.venue,
            capabilities: resp.capabilities,
        }
    }

    /// Current role if set, non-empty and held. Anything else counts as no role.
    #[must_use]
    pub fn usable_current_role(&self) -> Option<&str> {
        self.current_role
            .as_deref()
            .filter(|role| !role.trim().is_empty() && self.roles.contains(*role))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum HydrationStatus {
    Idle,
    InFlight,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub seq: u64,
    epoch: u64,
    session_key: String,
}

impl FetchTicket {
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied,
    Stale,
}

#[derive(Debug, Default)]
pub struct ProfileHydrator {
    profile: Option<Profile>,
    status: Option<HydrationError>,
    in_flight: bool,
    succeeded: bool,
    epoch: u64,
    next_seq: u64,
    latest_issued: u64,
    applied_seq: u64,
    session_key: Option<String>,
}

impl ProfileHydrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> HydrationStatus {
        if self.in_flight {
            HydrationStatus::InFlight
        } else if let Some(e) = &self.status {
            HydrationStatus::Failed(e.to_string())
        } else if self.succeeded {
            HydrationStatus::Succeeded
        } else {
            HydrationStatus::Idle
        }
    }

    /// Terminal outcome reached for the newest fetch, success or failure.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.in_flight && (self.succeeded || self.status.is_some())
    }

    /// Last error of a terminal failed hydration.
    #[must_use]
    pub fn error(&self) -> Option<&HydrationError> {
        if self.in_flight { None } else { self.status.as_ref() }
    }

    /// Issue a ticket for a fetch on behalf of `session_key`.
    pub fn begin(&mut self, session_key: &str) -> FetchTicket {
        if self.session_key.as_deref() != Some(session_key) {
            if self.session_key.is_some() {
                self.invalidate();
            }
            self.session_key = Some(session_key.to_string());
        }
        self.next_seq += 1;
        self.latest_issued = self.next_seq;
        self.in_flight = true;
        debug!(seq = self.next_seq, session_key, "profile fetch issued");
        FetchTicket { seq: self.next_seq, epoch: self.epoch, session_key: session_key.to_string() }
    }

    /// Report a fetch outcome.
    pub fn complete(&mut self, ticket: &FetchTicket, result: Result<Profile, HydrationError>) -> Completion {
        if ticket.epoch != self.epoch || self.session_key.as_deref() != Some(ticket.session_key.as_str()) {
            debug!(seq = ticket.seq, "discarding profile response from a previous session");
            return Completion::Stale;
        }
        if ticket.seq <= self.applied_seq {
            debug!(seq = ticket.seq, applied = self.applied_seq, "discarding out-of-order profile response");
            return Completion::Stale;
        }
        self.applied_seq = ticket.seq;
        let newest = ticket.seq == self.latest_issued;
        match result {
            Ok(profile) => {
                self.profile = Some(profile);
                self.succeeded = true;
                self.status = None;
            }
            Err(e) => {
                warn!(seq = ticket.seq, error = %e, "profile hydration failed");
                if newest {
                    self.status = Some(e);
                }
            }
        }
        if newest {
            self.in_flight = false;
        }
        Completion::Applied
    }

    /// Hard-timeout escape: end an in-flight hydration as `TimedOut`.
    /// Tickets stay valid, so a late response still applies.
    pub fn force_terminal(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        self.in_flight = false;
        self.status = Some(HydrationError::TimedOut);
        true
    }

    /// Drop the profile and every outstanding ticket.
    pub fn invalidate(&mut self) {
        self.epoch += 1;
        self.profile = None;
        self.status = None;
        self.in_flight = false;
        self.succeeded = false;
        self.session_key = None;
        self.applied_seq = self.latest_issued;
    }
}

/// Fetch the profile, retrying a retryable failure exactly once after a jittered delay.
pub async fn fetch_with_retry(
    api: &dyn ProfileApi,
    session: &ProviderSession,
    retry_delay: Duration,
) -> Result<ProfileResponse, HydrationError> {
    match api.fetch_profile(session).await {
        Err(e) if e.retryable() => {
            let base_ms = u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX);
            let jitter_ms = rand::rng().random_range(0..=base_ms / 2);
            warn!(error = %e, delay_ms = base_ms + jitter_ms, "profile fetch failed; retrying once");
            tokio::time::sleep(Duration::from_millis(base_ms.saturating_add(jitter_ms))).await;
            api.fetch_profile(session).await
        }
        other => other,
    }
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;
