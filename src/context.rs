//! Auth context: the one process-wide owner of identity, profile and timers.
//!
//! ARCHITECTURE
//! ============
//! `AuthContext` is created once at boot ([`AuthContext::init`]) and torn
//! down on logout ([`AuthContext::logout`]) or unmount
//! ([`AuthContext::shutdown`]). It is injected wherever a route decision is
//! needed; nothing reads auth state from globals.
//!
//! Control flow: provider push → identity transition → profile fetch →
//! readiness recompute → timers arm/disarm → gate re-evaluates on demand.
//! A driver task multiplexes provider pushes and timer firings with
//! `tokio::select!`; it holds only a weak handle, so dropping the last
//! context stops it.
//!
//! CONCURRENCY
//! ===========
//! All state sits behind one short-held mutex. No lock is held across an
//! await: fetches and mutations run outside it and report back through
//! sequence/epoch-checked tickets, so a slow stale response never clobbers a
//! fresher one and anything issued before a logout is discarded.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::error::ErrorCode;
use crate::gate::policy::RouteTable;
use crate::gate::{Decision, GateInput, GateState, RouteGate, decide};
use crate::identity::bypass::load_bypass;
use crate::identity::provider::{IdentityProvider, ProviderEvent, ProviderSession};
use crate::identity::{IdentitySignal, IdentityStatus, Session, SessionTransition, now_ms};
use crate::profile::api::ProfileApi;
use crate::profile::{Completion, FetchTicket, HydrationError, HydrationStatus, Profile, ProfileHydrator, fetch_with_retry};
use crate::readiness::{ReadinessInputs, ReadinessState, aggregate};
use crate::roles::{RoleError, RoleResolver};
use crate::store::LocalStore;
use crate::timeout::{TimeoutSupervisor, TimerFired, TimerKind};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error(transparent)]
    InvalidRole(#[from] RoleError),
    #[error("profile mutation failed: {0}")]
    Mutation(#[from] HydrationError),
    #[error("profile mutation cancelled by logout")]
    Cancelled,
}

impl ErrorCode for ContextError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
            Self::InvalidRole(e) => e.error_code(),
            Self::Mutation(e) => e.error_code(),
            Self::Cancelled => "E_MUTATION_CANCELLED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Mutation(e) => e.retryable(),
            Self::Cancelled => true,
            _ => false,
        }
    }
}

/// Read-only snapshot of the visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub session: Session,
    pub profile: Option<Profile>,
    pub hydration: HydrationStatus,
    /// Auth satisfied by the test-mode bypass rather than a provider session.
    pub via_bypass: bool,
}

// =============================================================================
// MUTATION TRACKING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MutationTicket {
    id: u64,
    epoch: u64,
}

#[derive(Debug, Default)]
struct MutationTracker {
    next_id: u64,
    epoch: u64,
    in_flight: HashSet<u64>,
}

impl MutationTracker {
    fn begin(&mut self) -> MutationTicket {
        self.next_id += 1;
        self.in_flight.insert(self.next_id);
        MutationTicket { id: self.next_id, epoch: self.epoch }
    }

    /// Issued under the current session, even if the hard timeout stopped waiting on it.
    fn same_session(&self, ticket: &MutationTicket) -> bool {
        ticket.epoch == self.epoch
    }

    fn finish(&mut self, ticket: &MutationTicket) -> bool {
        ticket.epoch == self.epoch && self.in_flight.remove(&ticket.id)
    }

    /// Stop waiting on every mutation; late completions become no-ops.
    fn abandon_all(&mut self) {
        self.in_flight.clear();
    }

    /// Logout: abandon and invalidate every outstanding ticket.
    fn invalidate(&mut self) {
        self.epoch += 1;
        self.in_flight.clear();
    }

    fn len(&self) -> usize {
        self.in_flight.len()
    }
}

enum Mutation {
    SwitchRole(String),
    CompleteOnboarding(serde_json::Value),
}

impl Mutation {
    fn label(&self) -> &'static str {
        match self {
            Self::SwitchRole(_) => "switch_role",
            Self::CompleteOnboarding(_) => "complete_onboarding",
        }
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

struct ContextInner {
    identity: IdentitySignal,
    hydrator: ProfileHydrator,
    mutations: MutationTracker,
    supervisor: TimeoutSupervisor,
    gate: RouteGate,
    bypass: Option<Profile>,
    version: u64,
}

impl ContextInner {
    fn bypass_active(&self) -> bool {
        self.bypass.is_some() && self.identity.status() != IdentityStatus::Present
    }

    fn readiness(&self) -> ReadinessState {
        aggregate(&ReadinessInputs {
            identity: self.identity.status(),
            bypass_active: self.bypass_active(),
            hydration_terminal: self.hydrator.is_terminal(),
            mutations_in_flight: self.mutations.len(),
        })
    }

    fn current_user(&self) -> CurrentUser {
        let (_, profile) = auth_view(&self.identity, &self.hydrator, self.bypass.as_ref());
        CurrentUser {
            session: self.identity.session().clone(),
            profile: profile.cloned(),
            hydration: self.hydrator.status(),
            via_bypass: self.bypass_active(),
        }
    }
}

/// `(has_auth, profile)` as the gate sees them. A real session wins over the bypass.
fn auth_view<'a>(
    identity: &IdentitySignal,
    hydrator: &'a ProfileHydrator,
    bypass: Option<&'a Profile>,
) -> (bool, Option<&'a Profile>) {
    if identity.status() == IdentityStatus::Present {
        return (true, hydrator.profile());
    }
    match bypass {
        Some(profile) => (true, Some(profile)),
        None => (false, None),
    }
}

struct Shared {
    inner: Mutex<ContextInner>,
    config: GateConfig,
    routes: RouteTable,
    resolver: RoleResolver,
    provider: Arc<dyn IdentityProvider>,
    api: Arc<dyn ProfileApi>,
    changes: watch::Sender<u64>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct AuthContext {
    shared: Arc<Shared>,
}

impl AuthContext {
    /// Boot: load the bypass, subscribe to the provider, seed from its current
    /// session and start the driver. Must run inside a tokio runtime.
    pub async fn init(
        config: GateConfig,
        routes: RouteTable,
        provider: Arc<dyn IdentityProvider>,
        api: Arc<dyn ProfileApi>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        // Subscribe before reading the current session so no push falls in between.
        let events = provider.on_session_change();
        let bypass = load_bypass(config.e2e_bypass, store.as_ref());
        let resolver = RoleResolver::new(config.aliases.clone());
        let timeouts = config.timeouts;

        let inner = ContextInner {
            identity: IdentitySignal::new(store, timeouts.transient_null_grace),
            hydrator: ProfileHydrator::new(),
            mutations: MutationTracker::default(),
            supervisor: TimeoutSupervisor::new(timeouts.soft, timeouts.hard, timer_tx),
            gate: RouteGate::new(config.paths.clone(), resolver.clone(), timeouts.grace),
            bypass,
            version: 0,
        };
        let (changes, _) = watch::channel(0);
        let ctx = Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                config,
                routes,
                resolver,
                provider,
                api,
                changes,
                driver: Mutex::new(None),
            }),
        };

        let driver = tokio::spawn(drive(Arc::downgrade(&ctx.shared), events, timer_rx));
        *ctx
            .shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(driver);

        {
            let mut inner = ctx.lock();
            ctx.recompute(&mut inner);
        }

        match ctx.shared.provider.current_session().await {
            Ok(Some(session)) => ctx.handle_provider_event(&ProviderEvent::SignedIn(session)),
            Ok(None) => debug!("no provider session at boot; awaiting identity"),
            Err(e) => warn!(error = %e, "provider session read failed at boot; awaiting identity"),
        }

        let readiness = ctx.readiness();
        info!(
            ready = readiness.is_system_ready,
            hydrating = readiness.is_hydrating,
            bypass = ctx.lock().bypass.is_some(),
            "auth context initialized"
        );
        ctx
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.shared.routes
    }

    // -------------------------------------------------------------------------
    // Exposed surface
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn readiness(&self) -> ReadinessState {
        self.lock().readiness()
    }

    #[must_use]
    pub fn is_system_ready(&self) -> bool {
        self.readiness().is_system_ready
    }

    #[must_use]
    pub fn is_hydrating(&self) -> bool {
        self.readiness().is_hydrating
    }

    #[must_use]
    pub fn current_user(&self) -> CurrentUser {
        self.lock().current_user()
    }

    #[must_use]
    pub fn gate_state(&self) -> GateState {
        self.lock().gate.state()
    }

    /// Change notifications; the value is a monotonically increasing version.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Evaluate the gate for `path` against the latest state.
    #[must_use]
    pub fn evaluate(&self, path: &str) -> Decision {
        let policy = self.shared.routes.policy_for(path);
        let mut guard = self.lock();
        let readiness = guard.readiness();
        let inner = &mut *guard;
        let (has_auth, profile) = auth_view(&inner.identity, &inner.hydrator, inner.bypass.as_ref());
        let input = GateInput { path, policy: &policy, readiness, has_auth, profile };
        inner.gate.evaluate(&input, Instant::now())
    }

    /// Evaluate until the gate commits to something other than `Loading`.
    ///
    /// Bounded by the hard timer, which always drives readiness to a terminal state.
    pub async fn resolve(&self, path: &str) -> Decision {
        let mut changes = self.shared.changes.subscribe();
        loop {
            let decision = self.evaluate(path);
            if !decision.is_loading() {
                return decision;
            }
            let grace_left = self.lock().gate.grace_remaining(Instant::now());
            match grace_left {
                Some(left) => {
                    let _ = tokio::time::timeout(left, changes.changed()).await;
                }
                None => {
                    if changes.changed().await.is_err() {
                        return Decision::Loading;
                    }
                }
            }
        }
    }

    /// Switch the current role through the backend, then re-hydrate.
    pub async fn trigger_role_switch(&self, role: &str) -> Result<CurrentUser, ContextError> {
        self.shared.resolver.normalize(role)?;
        self.mutate(Mutation::SwitchRole(role.trim().to_string()))
            .await
    }

    /// Submit onboarding through the backend, then re-hydrate.
    pub async fn complete_onboarding(&self, payload: serde_json::Value) -> Result<CurrentUser, ContextError> {
        self.mutate(Mutation::CompleteOnboarding(payload)).await
    }

    /// Where to send a visitor who just finished signing in.
    pub async fn trigger_post_auth_redirect(&self) -> Decision {
        let mut changes = self.shared.changes.subscribe();
        while !self.is_system_ready() {
            if changes.changed().await.is_err() {
                return Decision::Loading;
            }
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let paths = inner.gate.paths().clone();
        let (has_auth, profile) = auth_view(&inner.identity, &inner.hydrator, inner.bypass.as_ref());
        if !has_auth {
            return Decision::redirect(paths.login);
        }
        let Some(profile) = profile else {
            warn!("post-auth redirect without a profile; rendering fallback");
            return Decision::Render { fallback: Some(paths.fallback) };
        };
        if !profile.is_onboarded {
            return Decision::redirect(paths.onboarding);
        }
        let Some(category) = self.shared.resolver.current_category(profile) else {
            return Decision::redirect(paths.role_selection);
        };

        if let Some(intended) = inner.gate.take_intended_path() {
            let policy = self.shared.routes.policy_for(&intended);
            let readiness = inner.readiness();
            let input = GateInput { path: &intended, policy: &policy, readiness, has_auth, profile: Some(profile) };
            if decide(&input, &paths, &self.shared.resolver).decision == Decision::render() {
                return Decision::redirect(intended);
            }
            debug!(%intended, "intended path no longer allowed; using dashboard");
        }
        Decision::redirect(paths.dashboard_for(category))
    }

    /// Teardown on logout. Synchronous: readiness is not-ready when this returns.
    pub fn logout(&self) {
        let mut inner = self.lock();
        inner.identity.reset();
        inner.hydrator.invalidate();
        inner.mutations.invalidate();
        inner.gate.reset();
        inner.bypass = None;
        inner.supervisor.cancel_recheck();
        inner.supervisor.rearm();
        self.recompute(&mut inner);
        info!("logout: auth context reset");
    }

    /// Unmount: stop the driver and clear every timer.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        {
            let mut inner = self.lock();
            inner.supervisor.disarm();
            inner.supervisor.cancel_recheck();
        }
        info!("auth context shut down");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn recompute(&self, inner: &mut ContextInner) -> ReadinessState {
        let readiness = inner.readiness();
        inner.supervisor.sync(readiness.is_system_ready);
        inner.version += 1;
        self.shared.changes.send_replace(inner.version);
        readiness
    }

    fn handle_provider_event(&self, event: &ProviderEvent) {
        let mut inner = self.lock();
        if matches!(event, ProviderEvent::SignedIn(_)) {
            inner.supervisor.cancel_recheck();
        }
        let fetch = match inner.identity.apply(event, now_ms()) {
            SessionTransition::Unchanged => None,
            SessionTransition::SignOutDeferred { recheck_in } => {
                inner.supervisor.schedule_recheck(recheck_in);
                None
            }
            SessionTransition::BecamePresent { identity_id } => Some(identity_id),
            SessionTransition::IdentityChanged { identity_id } => {
                inner.hydrator.invalidate();
                inner.mutations.invalidate();
                inner.gate.reset();
                Some(identity_id)
            }
            SessionTransition::BecameAbsent => {
                inner.supervisor.cancel_recheck();
                inner.hydrator.invalidate();
                inner.mutations.invalidate();
                None
            }
        };
        if let Some(identity_id) = fetch {
            let ticket = inner.hydrator.begin(&identity_id);
            if let Some(credentials) = inner.identity.credentials().cloned() {
                let ctx = self.clone();
                tokio::spawn(async move { ctx.run_hydration(ticket, credentials).await });
            }
        }
        self.recompute(&mut inner);
    }

    async fn handle_timer(&self, fired: TimerFired) {
        match fired.kind {
            TimerKind::Soft => self.on_soft_timeout(fired),
            TimerKind::Hard => self.on_hard_timeout(fired),
            TimerKind::SignOutRecheck => self.recheck_sign_out(fired).await,
        }
    }

    fn current_timer(&self, fired: &TimerFired) -> Option<MutexGuard<'_, ContextInner>> {
        let inner = self.lock();
        if inner.supervisor.is_current(fired) {
            return Some(inner);
        }
        debug!(kind = fired.kind.as_str(), generation = fired.generation, "stale timer firing ignored");
        None
    }

    fn on_soft_timeout(&self, fired: TimerFired) {
        let Some(mut inner) = self.current_timer(&fired) else { return };
        match inner.identity.status() {
            IdentityStatus::Unknown if inner.identity.recently_authenticated(now_ms()) => {
                warn!("soft timeout: recent sign-in on record; waiting for provider");
            }
            IdentityStatus::Unknown => {
                warn!("soft timeout: no identity reported; resolving unauthenticated");
                inner.identity.resolve_unauthenticated();
            }
            IdentityStatus::Present => {
                warn!(hydration = ?inner.hydrator.status(), "soft timeout: identity present, profile pending; not forcing");
            }
            IdentityStatus::Absent => {
                warn!(mutations = inner.mutations.len(), "soft timeout: waiting on in-flight mutation");
            }
        }
        self.recompute(&mut inner);
    }

    fn on_hard_timeout(&self, fired: TimerFired) {
        let Some(mut inner) = self.current_timer(&fired) else { return };
        warn!(
            identity = ?inner.identity.status(),
            hydration = ?inner.hydrator.status(),
            mutations = inner.mutations.len(),
            "hard timeout: forcing degraded readiness"
        );
        inner.identity.resolve_unauthenticated();
        inner.hydrator.force_terminal();
        inner.mutations.abandon_all();
        inner.supervisor.disarm();
        self.recompute(&mut inner);
    }

    /// The transient window closed on a deferred sign-out: the provider's
    /// current session decides.
    async fn recheck_sign_out(&self, fired: TimerFired) {
        let pending = self.current_timer(&fired).is_some();
        if !pending {
            return;
        }
        let session = match self.shared.provider.current_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "provider session read failed; applying deferred sign-out");
                None
            }
        };
        let Some(mut inner) = self.current_timer(&fired) else { return };
        inner.supervisor.cancel_recheck();
        match session {
            Some(session) => {
                debug!(identity_id = %session.identity_id, "provider still signed in after transient sign-out");
                drop(inner);
                self.handle_provider_event(&ProviderEvent::SignedIn(session));
            }
            None => {
                if inner.identity.confirm_signed_out() {
                    inner.hydrator.invalidate();
                    inner.mutations.invalidate();
                }
                self.recompute(&mut inner);
            }
        }
    }

    async fn run_hydration(&self, ticket: FetchTicket, credentials: ProviderSession) {
        let result = self
            .fetch_profile(&credentials)
            .await
            .map(|resp| Profile::from_response(ticket.session_key(), resp));
        let mut inner = self.lock();
        match inner.hydrator.complete(&ticket, result) {
            Completion::Applied => debug!(seq = ticket.seq, "profile hydration applied"),
            Completion::Stale => debug!(seq = ticket.seq, "profile hydration discarded"),
        }
        self.recompute(&mut inner);
    }

    /// Fetch with the hydrator's retry, plus one token refresh on 401.
    async fn fetch_profile(
        &self,
        credentials: &ProviderSession,
    ) -> Result<crate::profile::api::ProfileResponse, HydrationError> {
        let api = self.shared.api.as_ref();
        let delay = self.shared.config.timeouts.profile_retry_delay;
        match fetch_with_retry(api, credentials, delay).await {
            Err(HydrationError::Unauthorized) => {}
            other => return other,
        }
        match self.shared.provider.refresh_token().await {
            Ok(Some(fresh)) if fresh.identity_id == credentials.identity_id => {
                info!(identity_id = %fresh.identity_id, "profile fetch unauthorized; token refreshed");
                {
                    let mut inner = self.lock();
                    inner.identity.refresh_credentials(fresh.clone());
                }
                fetch_with_retry(api, &fresh, delay).await
            }
            Ok(_) => Err(HydrationError::Unauthorized),
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                Err(HydrationError::Unauthorized)
            }
        }
    }

    async fn mutate(&self, mutation: Mutation) -> Result<CurrentUser, ContextError> {
        let (ticket, credentials) = {
            let mut inner = self.lock();
            let Some(credentials) = inner.identity.credentials().cloned() else {
                return Err(ContextError::NotAuthenticated);
            };
            let ticket = inner.mutations.begin();
            self.recompute(&mut inner);
            (ticket, credentials)
        };
        info!(mutation = mutation.label(), "profile mutation started");

        let outcome = match &mutation {
            Mutation::SwitchRole(role) => self.shared.api.switch_role(&credentials, role).await,
            Mutation::CompleteOnboarding(payload) => {
                self.shared
                    .api
                    .complete_onboarding(&credentials, payload)
                    .await
            }
        };
        if let Err(e) = outcome {
            warn!(mutation = mutation.label(), error = %e, "profile mutation failed");
            let mut inner = self.lock();
            inner.mutations.finish(&ticket);
            self.recompute(&mut inner);
            return Err(e.into());
        }

        let fetch = {
            let mut inner = self.lock();
            let identity_id = inner.identity.session().identity_id.clone();
            match identity_id {
                Some(id) if inner.mutations.same_session(&ticket) => Some(inner.hydrator.begin(&id)),
                _ => None,
            }
        };
        let Some(fetch) = fetch else {
            debug!(mutation = mutation.label(), "mutation outlived its session; skipping re-hydration");
            return Err(ContextError::Cancelled);
        };
        self.run_hydration(fetch, credentials).await;

        let mut inner = self.lock();
        let same_session = inner.mutations.same_session(&ticket);
        inner.mutations.finish(&ticket);
        self.recompute(&mut inner);
        if !same_session {
            debug!(mutation = mutation.label(), "session ended during re-hydration");
            return Err(ContextError::Cancelled);
        }
        info!(mutation = mutation.label(), "profile mutation settled");
        Ok(inner.current_user())
    }
}

async fn drive(
    shared: Weak<Shared>,
    mut events: broadcast::Receiver<ProviderEvent>,
    mut timers: mpsc::UnboundedReceiver<TimerFired>,
) {
    let mut events_open = true;
    loop {
        tokio::select! {
            event = events.recv(), if events_open => {
                let Some(shared) = shared.upgrade() else { break };
                let ctx = AuthContext { shared };
                match event {
                    Ok(event) => ctx.handle_provider_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "provider events lagged; resyncing from current session");
                        let resync = match ctx.shared.provider.current_session().await {
                            Ok(Some(session)) => Some(ProviderEvent::SignedIn(session)),
                            Ok(None) => Some(ProviderEvent::SignedOut),
                            Err(e) => {
                                warn!(error = %e, "provider resync failed");
                                None
                            }
                        };
                        if let Some(event) = resync {
                            ctx.handle_provider_event(&event);
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("identity provider closed its event stream");
                        events_open = false;
                    }
                }
            }
            Some(fired) = timers.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                AuthContext { shared }.handle_timer(fired).await;
            }
            else => break,
        }
    }
    debug!("auth context driver stopped");
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
