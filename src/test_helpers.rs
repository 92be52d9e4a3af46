//! Shared test fixtures: a scripted profile backend and context boot helpers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::config::GateConfig;
use crate::context::AuthContext;
use crate::gate::policy::RouteTable;
use crate::identity::provider::{ProviderEvent, ProviderSession, PushIdentityProvider};
use crate::profile::HydrationError;
use crate::profile::api::{ProfileApi, ProfileResponse};
use crate::store::MemoryStore;

type FetchResult = Result<ProfileResponse, HydrationError>;

enum ScriptedFetch {
    Now(FetchResult),
    /// Resolves when the paired sender fires; pends forever if it is dropped unused.
    Gated(oneshot::Receiver<FetchResult>),
}

/// In-memory backend. Scripted fetches are served first, then the live
/// backend record, which `switch_role` and `complete_onboarding` mutate.
pub struct MockProfileApi {
    scripted: Mutex<VecDeque<ScriptedFetch>>,
    backend: Mutex<ProfileResponse>,
    calls: Mutex<Vec<String>>,
    fail_mutations: Mutex<Option<HydrationError>>,
}

impl MockProfileApi {
    pub fn new(backend: ProfileResponse) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            backend: Mutex::new(backend),
            calls: Mutex::new(Vec::new()),
            fail_mutations: Mutex::new(None),
        }
    }

    pub fn push_result(&self, result: FetchResult) {
        self.scripted
            .lock()
            .unwrap()
            .push_back(ScriptedFetch::Now(result));
    }

    /// Queue a fetch that resolves only when the returned sender is used.
    pub fn push_gated(&self) -> oneshot::Sender<FetchResult> {
        let (tx, rx) = oneshot::channel();
        self.scripted
            .lock()
            .unwrap()
            .push_back(ScriptedFetch::Gated(rx));
        tx
    }

    pub fn fail_mutations_with(&self, err: HydrationError) {
        *self.fail_mutations.lock().unwrap() = Some(err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.as_str() == "fetch")
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProfileApi for MockProfileApi {
    async fn fetch_profile(&self, _session: &ProviderSession) -> FetchResult {
        self.record("fetch".into());
        let next = self.scripted.lock().unwrap().pop_front();
        match next {
            Some(ScriptedFetch::Now(result)) => result,
            Some(ScriptedFetch::Gated(rx)) => match rx.await {
                Ok(result) => result,
                Err(_) => std::future::pending().await,
            },
            None => Ok(self.backend.lock().unwrap().clone()),
        }
    }

    async fn switch_role(&self, _session: &ProviderSession, role: &str) -> Result<(), HydrationError> {
        self.record(format!("switch_role:{role}"));
        if let Some(err) = self.fail_mutations.lock().unwrap().clone() {
            return Err(err);
        }
        let mut backend = self.backend.lock().unwrap();
        if !backend.roles.iter().any(|r| r == role) {
            backend.roles.push(role.to_string());
        }
        backend.current_role = Some(role.to_string());
        Ok(())
    }

    async fn complete_onboarding(
        &self,
        _session: &ProviderSession,
        _payload: &serde_json::Value,
    ) -> Result<(), HydrationError> {
        self.record("complete_onboarding".into());
        if let Some(err) = self.fail_mutations.lock().unwrap().clone() {
            return Err(err);
        }
        self.backend.lock().unwrap().is_onboarded = true;
        Ok(())
    }
}

pub fn profile_response(roles: &[&str], current: Option<&str>, onboarded: bool) -> ProfileResponse {
    ProfileResponse {
        roles: roles.iter().map(|r| (*r).to_string()).collect(),
        current_role: current.map(str::to_string),
        is_onboarded: onboarded,
        venue: None,
        capabilities: Vec::new(),
    }
}

pub fn signed_in(identity_id: &str) -> ProviderEvent {
    ProviderEvent::SignedIn(ProviderSession {
        identity_id: identity_id.to_string(),
        access_token: Some(format!("token-{identity_id}")),
    })
}

/// Defaults with the grace period and transient-null window disabled so
/// decisions commit on first evaluation and sign-outs apply immediately.
pub fn test_config() -> GateConfig {
    let mut config = GateConfig::default();
    config.timeouts.grace = Duration::ZERO;
    config.timeouts.transient_null_grace = Duration::ZERO;
    config.timeouts.profile_retry_delay = Duration::from_millis(10);
    config
}

pub struct Harness {
    pub ctx: AuthContext,
    pub provider: Arc<PushIdentityProvider>,
    pub api: Arc<MockProfileApi>,
    pub store: Arc<MemoryStore>,
}

pub async fn boot_with(config: GateConfig, api: Arc<MockProfileApi>, store: Arc<MemoryStore>) -> Harness {
    let provider = Arc::new(PushIdentityProvider::new());
    let routes = RouteTable::marketplace(&config.paths);
    let ctx = AuthContext::init(config, routes, provider.clone(), api.clone(), store.clone()).await;
    Harness { ctx, provider, api, store }
}

pub async fn boot(backend: ProfileResponse) -> Harness {
    boot_with(test_config(), Arc::new(MockProfileApi::new(backend)), Arc::new(MemoryStore::new())).await
}

/// Wait (in virtual time) until `cond` holds. Panics after `limit`.
pub async fn wait_until<F>(ctx: &AuthContext, limit: Duration, cond: F)
where
    F: Fn(&AuthContext) -> bool,
{
    let mut changes = ctx.subscribe();
    let deadline = tokio::time::Instant::now() + limit;
    while !cond(ctx) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "condition not reached within {limit:?}");
        let _ = tokio::time::timeout(remaining, changes.changed()).await;
    }
}

/// Let spawned tasks run without advancing virtual time.
pub async fn drain() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
