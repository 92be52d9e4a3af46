//! Route gate: decides Render / Redirect / Loading for one navigation.
//!
//! ARCHITECTURE
//! ============
//! `AwaitingIdentity → Hydrating → GracePeriod → Deciding → {Rendering | Redirecting}`.
//! The gate is re-evaluated on every render with the latest snapshot; it
//! holds only the bookkeeping needed across evaluations (pending redirect
//! for the grace period, recent redirect trail for the loop guard).
//!
//! DECISION RULES (in order)
//! =========================
//! 1. `requireAuth` without auth → login, preserving the intended path.
//!    A route's `redirect_to` never replaces the login target.
//! 2. Not onboarded and not on onboarding → onboarding.
//! 3. Onboarded and on onboarding → role dashboard.
//! 4. No usable current role → role selection.
//! 5. Authenticated on login/signup → own dashboard; role mismatch → the
//!    route's `redirect_to`, else unauthorized.
//! 6. Otherwise render.
//!
//! LOOP GUARD
//! ==========
//! Never redirect to the current path. A redirect whose reverse edge was
//! already taken under the same user state, or a chain longer than
//! [`MAX_REDIRECT_CHAIN`], renders the fallback view in place instead.

pub mod policy;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::profile::Profile;
use crate::readiness::ReadinessState;
use crate::roles::RoleResolver;
use policy::{GatePaths, RoutePolicy, normalize_path};

pub const MAX_REDIRECT_CHAIN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    AwaitingIdentity,
    Hydrating,
    GracePeriod,
    Deciding,
    Rendering,
    Redirecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Loading,
    /// Render the requested page, or the `fallback` view in place when set.
    Render { fallback: Option<String> },
    /// Navigate with history replacement when `replace` is set (always, for gate redirects).
    Redirect { target: String, replace: bool },
}

impl Decision {
    #[must_use]
    pub fn render() -> Self {
        Self::Render { fallback: None }
    }

    #[must_use]
    pub fn redirect(target: impl Into<String>) -> Self {
        Self::Redirect { target: target.into(), replace: true }
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Redirect { target, .. } => Some(target),
            Self::Render { fallback } => fallback.as_deref(),
            Self::Loading => None,
        }
    }
}

/// Why the rules produced a decision. Logged with every committed redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Public,
    Unauthenticated,
    /// Authenticated, but hydration ended without a profile.
    ProfileUnavailable,
    NotOnboarded,
    AlreadyOnboarded,
    NoRole,
    AuthPage,
    RoleMismatch,
    Allowed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: Reason,
}

impl Verdict {
    fn render(reason: Reason) -> Self {
        Self { decision: Decision::render(), reason }
    }

    fn redirect(target: impl Into<String>, reason: Reason) -> Self {
        Self { decision: Decision::redirect(target), reason }
    }
}

/// Snapshot the gate evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub path: &'a str,
    pub policy: &'a RoutePolicy,
    pub readiness: ReadinessState,
    /// Provider session present, or test bypass active.
    pub has_auth: bool,
    pub profile: Option<&'a Profile>,
}

// =============================================================================
// RULES
// =============================================================================

/// Apply rules 1-6. Pure; assumes the system is ready.
#[must_use]
pub fn decide(input: &GateInput<'_>, paths: &GatePaths, resolver: &RoleResolver) -> Verdict {
    let path = normalize_path(input.path);
    let policy = input.policy;

    if !input.has_auth {
        if policy.require_auth {
            return Verdict::redirect(login_target(&paths.login, input.path), Reason::Unauthenticated);
        }
        return Verdict::render(Reason::Public);
    }

    let Some(profile) = input.profile else {
        if policy.require_auth {
            return Verdict::redirect(login_target(&paths.login, input.path), Reason::ProfileUnavailable);
        }
        return Verdict::render(Reason::Public);
    };

    if !profile.is_onboarded {
        if path == paths.onboarding {
            return Verdict::render(Reason::NotOnboarded);
        }
        return Verdict::redirect(paths.onboarding.clone(), Reason::NotOnboarded);
    }

    let category = resolver.current_category(profile);
    if path == paths.onboarding {
        let home = category.map_or(paths.role_selection.as_str(), |c| paths.dashboard_for(c));
        return Verdict::redirect(home, Reason::AlreadyOnboarded);
    }

    let Some(category) = category else {
        if path == paths.role_selection {
            return Verdict::render(Reason::NoRole);
        }
        return Verdict::redirect(paths.role_selection.clone(), Reason::NoRole);
    };

    if paths.is_auth_page(path) {
        return Verdict::redirect(paths.dashboard_for(category), Reason::AuthPage);
    }

    if !resolver.eligible(profile, policy) {
        let target = policy.redirect_to.as_deref().unwrap_or(&paths.unauthorized);
        return Verdict::redirect(target, Reason::RoleMismatch);
    }

    Verdict::render(Reason::Allowed)
}

/// Login path with the intended destination preserved as `?redirect=`.
#[must_use]
pub fn login_target(login: &str, intended: &str) -> String {
    let intended_path = normalize_path(intended);
    if intended_path == normalize_path(login) || intended_path == "/" {
        return login.to_string();
    }
    let encoded: String = url::form_urlencoded::byte_serialize(intended.as_bytes()).collect();
    format!("{login}?redirect={encoded}")
}

fn fingerprint(input: &GateInput<'_>) -> u64 {
    let mut hasher = DefaultHasher::new();
    input.has_auth.hash(&mut hasher);
    if let Some(profile) = input.profile {
        profile.user_id.hash(&mut hasher);
        profile.roles.hash(&mut hasher);
        profile.current_role.hash(&mut hasher);
        profile.is_onboarded.hash(&mut hasher);
    }
    hasher.finish()
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone)]
struct PendingRedirect {
    from: String,
    target: String,
    fingerprint: u64,
    since: Instant,
}

#[derive(Debug)]
pub struct RouteGate {
    paths: GatePaths,
    resolver: RoleResolver,
    grace: Duration,
    state: GateState,
    pending: Option<PendingRedirect>,
    trail: Vec<(String, String)>,
    trail_fingerprint: Option<u64>,
    intended_path: Option<String>,
}

impl RouteGate {
    #[must_use]
    pub fn new(paths: GatePaths, resolver: RoleResolver, grace: Duration) -> Self {
        Self {
            paths,
            resolver,
            grace,
            state: GateState::AwaitingIdentity,
            pending: None,
            trail: Vec::new(),
            trail_fingerprint: None,
            intended_path: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        self.state
    }

    #[must_use]
    pub fn paths(&self) -> &GatePaths {
        &self.paths
    }

    /// Path an unauthenticated visitor was bounced from, kept for the post-auth redirect.
    pub fn take_intended_path(&mut self) -> Option<String> {
        self.intended_path.take()
    }

    /// Time left before the pending redirect may commit.
    #[must_use]
    pub fn grace_remaining(&self, now: Instant) -> Option<Duration> {
        self.pending
            .as_ref()
            .map(|p| self.grace.saturating_sub(now.saturating_duration_since(p.since)))
    }

    /// Logout: forget pending redirects, the trail and the intended path.
    pub fn reset(&mut self) {
        self.state = GateState::AwaitingIdentity;
        self.pending = None;
        self.trail.clear();
        self.trail_fingerprint = None;
        self.intended_path = None;
    }

    pub fn evaluate(&mut self, input: &GateInput<'_>, now: Instant) -> Decision {
        if input.readiness.is_hydrating {
            self.state = GateState::AwaitingIdentity;
            self.pending = None;
            return Decision::Loading;
        }
        if !input.readiness.is_system_ready {
            self.state = GateState::Hydrating;
            self.pending = None;
            return Decision::Loading;
        }

        self.state = GateState::Deciding;
        let fingerprint = fingerprint(input);
        if self.trail_fingerprint != Some(fingerprint) {
            self.trail.clear();
            self.trail_fingerprint = Some(fingerprint);
        }

        let verdict = decide(input, &self.paths, &self.resolver);
        let reason = verdict.reason;
        let target = match verdict.decision {
            Decision::Redirect { target, .. } => target,
            other => {
                self.pending = None;
                self.trail.clear();
                self.state = GateState::Rendering;
                return other;
            }
        };

        let from = normalize_path(input.path).to_string();
        let to = normalize_path(&target).to_string();
        if from == to {
            self.pending = None;
            self.state = GateState::Rendering;
            return Decision::render();
        }
        let reverses = self.trail.iter().any(|(f, t)| *f == to && *t == from);
        if reverses || self.trail.len() >= MAX_REDIRECT_CHAIN {
            warn!(%from, %to, chain = self.trail.len(), reason = ?reason, "redirect loop prevented; rendering fallback");
            self.pending = None;
            self.state = GateState::Rendering;
            return Decision::Render { fallback: Some(self.paths.fallback.clone()) };
        }

        let same_pending = self
            .pending
            .as_ref()
            .is_some_and(|p| p.from == from && p.target == target && p.fingerprint == fingerprint);
        if !same_pending {
            self.pending = Some(PendingRedirect { from: from.clone(), target: target.clone(), fingerprint, since: now });
        }
        let waited = self
            .pending
            .as_ref()
            .map_or(Duration::ZERO, |p| now.saturating_duration_since(p.since));
        if waited < self.grace {
            debug!(%from, %target, "redirect pending grace period");
            self.state = GateState::GracePeriod;
            return Decision::Loading;
        }

        self.pending = None;
        self.trail.push((from.clone(), to));
        if matches!(reason, Reason::Unauthenticated | Reason::ProfileUnavailable) {
            self.intended_path = Some(input.path.to_string());
        }
        info!(%from, %target, ?reason, "redirect committed");
        self.state = GateState::Redirecting;
        Decision::redirect(target)
    }
}

#[cfg(test)]
#[path = "gate_test.rs"]
mod tests;
