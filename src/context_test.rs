use std::time::Duration;

use super::*;
use crate::identity::provider::PushIdentityProvider;
use crate::store::{MemoryStore, SYNTHETIC_USER_KEY};
use crate::test_helpers::{
    Harness, MockProfileApi, boot, boot_with, drain, profile_response, signed_in, test_config, wait_until,
};

const LIMIT: Duration = Duration::from_secs(60);

fn ready_with_profile(ctx: &AuthContext) -> bool {
    ctx.is_system_ready() && ctx.current_user().profile.is_some()
}

async fn signed_in_harness(backend: crate::profile::api::ProfileResponse) -> Harness {
    let h = boot(backend).await;
    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    h
}

// =============================================================================
// BOOT AND TIMEOUTS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn guest_resolves_to_login_after_soft_timeout() {
    let h = boot(profile_response(&[], None, false)).await;
    let started = tokio::time::Instant::now();

    assert!(h.ctx.is_hydrating());
    assert_eq!(h.ctx.evaluate("/dashboard"), Decision::Loading);
    assert_eq!(h.ctx.gate_state(), GateState::AwaitingIdentity);

    let decision = h.ctx.resolve("/dashboard").await;
    assert_eq!(decision, Decision::redirect("/login?redirect=%2Fdashboard"));
    assert!(started.elapsed() >= h.ctx.config().timeouts.soft);
    assert!(started.elapsed() < h.ctx.config().timeouts.hard);
    assert_eq!(h.ctx.current_user().session, Session::absent());
    assert_eq!(h.ctx.gate_state(), GateState::Redirecting);
}

#[tokio::test(start_paused = true)]
async fn guest_on_public_page_renders() {
    let h = boot(profile_response(&[], None, false)).await;
    assert_eq!(h.ctx.resolve("/terms").await, Decision::render());
}

#[tokio::test(start_paused = true)]
async fn guest_on_admin_page_resolves_to_login() {
    let h = boot(profile_response(&[], None, false)).await;
    let decision = h.ctx.resolve("/admin/users").await;
    assert_eq!(decision, Decision::redirect("/login?redirect=%2Fadmin%2Fusers"));
}

#[tokio::test(start_paused = true)]
async fn non_admin_on_admin_page_uses_route_redirect() {
    let h = signed_in_harness(profile_response(&["professional"], Some("professional"), true)).await;
    assert_eq!(h.ctx.evaluate("/admin/users"), Decision::redirect("/dashboard"));
}

#[tokio::test(start_paused = true)]
async fn recent_sign_in_stamp_defers_guest_resolution_to_hard_timeout() {
    let mut config = test_config();
    config.timeouts.transient_null_grace = Duration::from_secs(3600);
    let store = Arc::new(MemoryStore::new());
    store.set(crate::store::LAST_AUTHENTICATED_KEY, &now_ms().to_string());
    let h = boot_with(config, Arc::new(MockProfileApi::new(profile_response(&[], None, false))), store).await;
    let started = tokio::time::Instant::now();

    let decision = h.ctx.resolve("/dashboard").await;
    assert_eq!(decision, Decision::redirect("/login?redirect=%2Fdashboard"));
    assert!(started.elapsed() >= h.ctx.config().timeouts.hard);
}

#[tokio::test(start_paused = true)]
async fn provider_session_at_boot_hydrates_immediately() {
    let provider = Arc::new(PushIdentityProvider::new());
    provider.push(signed_in("alice"));
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    let config = test_config();
    let routes = RouteTable::marketplace(&config.paths);
    let ctx = AuthContext::init(config, routes, provider, api.clone(), Arc::new(MemoryStore::new())).await;

    assert!(!ctx.is_hydrating());
    wait_until(&ctx, LIMIT, ready_with_profile).await;
    assert_eq!(ctx.evaluate("/venue/dashboard"), Decision::render());
    assert_eq!(api.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn hard_timeout_forces_ready_and_late_profile_still_applies() {
    let backend = profile_response(&["venue"], Some("venue"), true);
    let api = Arc::new(MockProfileApi::new(backend.clone()));
    let gated = api.push_gated();
    let h = boot_with(test_config(), api, Arc::new(MemoryStore::new())).await;
    let started = tokio::time::Instant::now();

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, |c| c.current_user().session.status == IdentityStatus::Present).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!h.ctx.is_system_ready(), "soft timeout must not force while identity is present");
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::Loading);

    let decision = h.ctx.resolve("/venue/dashboard").await;
    assert!(started.elapsed() >= h.ctx.config().timeouts.hard);
    assert_eq!(decision, Decision::redirect("/login?redirect=%2Fvenue%2Fdashboard"));
    assert!(matches!(h.ctx.current_user().hydration, HydrationStatus::Failed(_)));

    gated.send(Ok(backend)).unwrap();
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    assert_eq!(h.ctx.current_user().hydration, HydrationStatus::Succeeded);
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::render());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_reacting_to_provider() {
    let h = boot(profile_response(&["venue"], Some("venue"), true)).await;
    h.ctx.shutdown();
    h.provider.push(signed_in("alice"));
    drain().await;
    assert_eq!(h.ctx.current_user().session.status, IdentityStatus::Unknown);
    assert_eq!(h.api.fetch_count(), 0);
}

// =============================================================================
// ROUTING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn signed_in_user_on_login_goes_to_own_dashboard() {
    let h = boot(profile_response(&["professional"], Some("professional"), true)).await;
    h.provider.push(signed_in("alice"));
    let decision = h.ctx.resolve("/login").await;
    assert_eq!(decision, Decision::redirect("/professional/dashboard"));
}

#[tokio::test(start_paused = true)]
async fn not_onboarded_user_goes_to_onboarding() {
    let h = signed_in_harness(profile_response(&[], None, false)).await;
    assert_eq!(h.ctx.resolve("/dashboard").await, Decision::redirect("/onboarding"));
    assert_eq!(h.ctx.resolve("/onboarding").await, Decision::render());
}

#[tokio::test(start_paused = true)]
async fn alias_role_renders_business_route() {
    let h = signed_in_harness(profile_response(&["hub"], Some("hub"), true)).await;
    assert_eq!(h.ctx.resolve("/venue/dashboard").await, Decision::render());
    assert_eq!(h.ctx.resolve("/professional/dashboard").await, Decision::redirect("/unauthorized"));
}

#[tokio::test(start_paused = true)]
async fn no_redirect_while_hydrating() {
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    let _gated = api.push_gated();
    let h = boot_with(test_config(), api, Arc::new(MemoryStore::new())).await;

    assert_eq!(h.ctx.evaluate("/professional/dashboard"), Decision::Loading);
    h.provider.push(signed_in("alice"));
    drain().await;
    assert_eq!(h.ctx.evaluate("/professional/dashboard"), Decision::Loading);
    assert_eq!(h.ctx.gate_state(), GateState::Hydrating);
}

// =============================================================================
// TEST-MODE BYPASS
// =============================================================================

const SYNTHETIC: &str = r#"{"userId":"e2e-venue","roles":["venue"],"currentRole":"venue","isOnboarded":true}"#;

#[tokio::test(start_paused = true)]
async fn bypass_with_flag_and_record_renders_without_provider() {
    let mut config = test_config();
    config.e2e_bypass = true;
    let store = Arc::new(MemoryStore::new());
    store.set(SYNTHETIC_USER_KEY, SYNTHETIC);
    let h = boot_with(config, Arc::new(MockProfileApi::new(profile_response(&[], None, false))), store).await;

    assert!(h.ctx.is_system_ready());
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::render());
    let user = h.ctx.current_user();
    assert!(user.via_bypass);
    assert_eq!(user.profile.map(|p| p.user_id), Some("e2e-venue".to_string()));
    assert_eq!(h.api.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn bypass_flag_without_record_is_inert() {
    let mut config = test_config();
    config.e2e_bypass = true;
    let h = boot_with(config, Arc::new(MockProfileApi::new(profile_response(&[], None, false))), Arc::new(MemoryStore::new())).await;

    assert!(h.ctx.is_hydrating());
    assert_eq!(h.ctx.resolve("/venue/dashboard").await, Decision::redirect("/login?redirect=%2Fvenue%2Fdashboard"));
    assert!(!h.ctx.current_user().via_bypass);
}

#[tokio::test(start_paused = true)]
async fn bypass_record_without_flag_is_inert() {
    let store = Arc::new(MemoryStore::new());
    store.set(SYNTHETIC_USER_KEY, SYNTHETIC);
    let h = boot_with(test_config(), Arc::new(MockProfileApi::new(profile_response(&[], None, false))), store).await;
    assert!(h.ctx.is_hydrating());
}

#[tokio::test(start_paused = true)]
async fn real_session_wins_over_bypass() {
    let mut config = test_config();
    config.e2e_bypass = true;
    let store = Arc::new(MemoryStore::new());
    store.set(SYNTHETIC_USER_KEY, SYNTHETIC);
    let api = Arc::new(MockProfileApi::new(profile_response(&["professional"], Some("professional"), true)));
    let h = boot_with(config, api, store).await;

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, |c| !c.current_user().via_bypass && ready_with_profile(c)).await;
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::redirect("/unauthorized"));
}

// =============================================================================
// HYDRATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn transient_fetch_failure_is_retried_once() {
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    api.push_result(Err(HydrationError::Transient("503".into())));
    let h = boot_with(test_config(), api, Arc::new(MemoryStore::new())).await;

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    assert_eq!(h.api.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn second_failure_settles_degraded() {
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    api.push_result(Err(HydrationError::Transient("503".into())));
    api.push_result(Err(HydrationError::Transient("503".into())));
    let h = boot_with(test_config(), api, Arc::new(MemoryStore::new())).await;

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, AuthContext::is_system_ready).await;
    let user = h.ctx.current_user();
    assert!(user.profile.is_none());
    assert!(matches!(user.hydration, HydrationStatus::Failed(_)));
    assert_eq!(h.api.fetch_count(), 2);
    assert_eq!(h.ctx.evaluate("/dashboard"), Decision::redirect("/login?redirect=%2Fdashboard"));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_fetch_refreshes_token_and_refetches() {
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    api.push_result(Err(HydrationError::Unauthorized));
    let h = boot_with(test_config(), api, Arc::new(MemoryStore::new())).await;

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    assert_eq!(h.api.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn identity_change_discards_previous_identity_profile() {
    let api = Arc::new(MockProfileApi::new(profile_response(&[], None, false)));
    let alice_fetch = api.push_gated();
    api.push_result(Ok(profile_response(&["professional"], Some("professional"), true)));
    let h = boot_with(test_config(), api, Arc::new(MemoryStore::new())).await;

    h.provider.push(signed_in("alice"));
    drain().await;
    h.provider.push(signed_in("bob"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;

    alice_fetch.send(Ok(profile_response(&["admin"], Some("admin"), true))).unwrap();
    drain().await;
    let profile = h.ctx.current_user().profile.unwrap();
    assert_eq!(profile.user_id, "bob");
    assert_eq!(profile.current_role.as_deref(), Some("professional"));
}

#[tokio::test(start_paused = true)]
async fn transient_sign_out_right_after_sign_in_is_ignored() {
    let mut config = test_config();
    config.timeouts.transient_null_grace = Duration::from_secs(3600);
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    let h = boot_with(config, api, Arc::new(MemoryStore::new())).await;

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    h.provider.push(ProviderEvent::SignedOut);
    drain().await;
    assert_eq!(h.ctx.current_user().session.status, IdentityStatus::Present);
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::render());
}

async fn transient_window_harness(window: Duration) -> Harness {
    let mut config = test_config();
    config.timeouts.transient_null_grace = window;
    let api = Arc::new(MockProfileApi::new(profile_response(&["venue"], Some("venue"), true)));
    let h = boot_with(config, api, Arc::new(MemoryStore::new())).await;
    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    h
}

#[tokio::test(start_paused = true)]
async fn transient_sign_out_is_confirmed_when_window_closes() {
    let h = transient_window_harness(Duration::from_secs(5)).await;
    h.provider.push(ProviderEvent::SignedOut);
    drain().await;
    assert_eq!(h.ctx.current_user().session.status, IdentityStatus::Present);
    assert!(h.ctx.lock().supervisor.has_recheck());

    let started = tokio::time::Instant::now();
    wait_until(&h.ctx, LIMIT, |c| c.current_user().session.status == IdentityStatus::Absent).await;
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert!(h.ctx.current_user().profile.is_none());
    assert!(!h.ctx.lock().supervisor.has_recheck());
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::redirect("/login?redirect=%2Fvenue%2Fdashboard"));
}

#[tokio::test(start_paused = true)]
async fn sign_in_inside_transient_window_cancels_recheck() {
    let h = transient_window_harness(Duration::from_secs(5)).await;
    h.provider.push(ProviderEvent::SignedOut);
    drain().await;
    h.provider.push(signed_in("alice"));
    drain().await;
    assert!(!h.ctx.lock().supervisor.has_recheck());

    tokio::time::sleep(Duration::from_secs(10)).await;
    drain().await;
    assert_eq!(h.ctx.current_user().session, Session::present("alice"));
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::render());
}

#[tokio::test(start_paused = true)]
async fn logout_cancels_pending_sign_out_recheck() {
    let h = transient_window_harness(Duration::from_secs(5)).await;
    h.provider.push(ProviderEvent::SignedOut);
    drain().await;
    assert!(h.ctx.lock().supervisor.has_recheck());

    h.ctx.logout();
    assert!(!h.ctx.lock().supervisor.has_recheck());
}

#[tokio::test(start_paused = true)]
async fn sign_out_drops_profile() {
    let h = signed_in_harness(profile_response(&["venue"], Some("venue"), true)).await;
    h.provider.push(ProviderEvent::SignedOut);
    wait_until(&h.ctx, LIMIT, |c| c.current_user().session.status == IdentityStatus::Absent).await;
    assert!(h.ctx.current_user().profile.is_none());
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::redirect("/login?redirect=%2Fvenue%2Fdashboard"));
}

// =============================================================================
// MUTATIONS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn role_switch_rehydrates_and_reroutes() {
    let h = signed_in_harness(profile_response(&["professional", "venue"], Some("professional"), true)).await;
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::render());

    let user = h.ctx.trigger_role_switch("Hub").await.unwrap();
    assert_eq!(user.profile.and_then(|p| p.current_role), Some("Hub".to_string()));
    assert!(h.ctx.is_system_ready());
    assert_eq!(h.ctx.evaluate("/login"), Decision::redirect("/venue/dashboard"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_role_switch_converges() {
    let h = signed_in_harness(profile_response(&["professional", "venue"], Some("professional"), true)).await;

    let (first, second) = tokio::join!(h.ctx.trigger_role_switch("venue"), h.ctx.trigger_role_switch("venue"));
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.profile.as_ref().and_then(|p| p.current_role.as_deref()), Some("venue"));
    assert_eq!(second.profile.as_ref().and_then(|p| p.current_role.as_deref()), Some("venue"));

    let user = h.ctx.current_user();
    assert_eq!(user.profile.as_ref().map(|p| p.roles.len()), Some(2));
    assert!(h.ctx.is_system_ready());
    assert!(!h.ctx.readiness().is_transitioning);
}

#[tokio::test(start_paused = true)]
async fn role_switch_is_transitioning_until_rehydrated() {
    let h = signed_in_harness(profile_response(&["professional", "venue"], Some("professional"), true)).await;
    let refetch = h.api.push_gated();

    let ctx = h.ctx.clone();
    let task = tokio::spawn(async move { ctx.trigger_role_switch("venue").await });
    wait_until(&h.ctx, LIMIT, |c| c.readiness().is_transitioning).await;
    drain().await;
    assert!(h.ctx.readiness().is_transitioning);
    assert!(!h.ctx.is_system_ready());
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::Loading);

    refetch
        .send(Ok(profile_response(&["professional", "venue"], Some("venue"), true)))
        .unwrap();
    let user = task.await.unwrap().unwrap();
    assert_eq!(user.profile.and_then(|p| p.current_role), Some("venue".to_string()));
    assert!(!h.ctx.readiness().is_transitioning);
    assert!(h.ctx.is_system_ready());
}

#[tokio::test(start_paused = true)]
async fn invalid_role_token_makes_no_backend_call() {
    let h = signed_in_harness(profile_response(&["venue"], Some("venue"), true)).await;
    let err = h.ctx.trigger_role_switch("superuser").await.unwrap_err();
    assert!(matches!(err, ContextError::InvalidRole(_)));
    assert_eq!(err.error_code(), "E_INVALID_ROLE_TOKEN");
    assert_eq!(h.api.calls(), vec!["fetch".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn mutation_without_session_is_rejected() {
    let h = boot(profile_response(&[], None, false)).await;
    let err = h.ctx.complete_onboarding(serde_json::json!({})).await.unwrap_err();
    assert!(matches!(err, ContextError::NotAuthenticated));
    assert!(h.api.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_mutation_restores_readiness() {
    let h = signed_in_harness(profile_response(&["venue"], Some("venue"), true)).await;
    h.api.fail_mutations_with(HydrationError::Transient("502".into()));

    let err = h.ctx.trigger_role_switch("professional").await.unwrap_err();
    assert!(matches!(err, ContextError::Mutation(HydrationError::Transient(_))));
    assert!(err.retryable());
    assert!(h.ctx.is_system_ready());
    assert_eq!(h.ctx.current_user().profile.and_then(|p| p.current_role), Some("venue".to_string()));
}

#[tokio::test(start_paused = true)]
async fn onboarding_completion_moves_user_off_onboarding() {
    let h = signed_in_harness(profile_response(&["venue"], Some("venue"), false)).await;
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::redirect("/onboarding"));

    let user = h
        .ctx
        .complete_onboarding(serde_json::json!({"venueName": "Blue Door"}))
        .await
        .unwrap();
    assert!(user.profile.is_some_and(|p| p.is_onboarded));
    assert_eq!(h.ctx.evaluate("/onboarding"), Decision::redirect("/venue/dashboard"));
}

#[tokio::test(start_paused = true)]
async fn logout_during_rehydration_cancels_mutation() {
    let h = signed_in_harness(profile_response(&["professional", "venue"], Some("professional"), true)).await;
    let refetch = h.api.push_gated();

    let ctx = h.ctx.clone();
    let task = tokio::spawn(async move { ctx.trigger_role_switch("venue").await });
    wait_until(&h.ctx, LIMIT, |c| c.readiness().is_transitioning).await;
    drain().await;

    h.ctx.logout();
    refetch
        .send(Ok(profile_response(&["professional", "venue"], Some("venue"), true)))
        .unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ContextError::Cancelled));
    assert!(h.ctx.current_user().profile.is_none());
    assert!(h.ctx.is_hydrating());
}

// =============================================================================
// LOGOUT AND POST-AUTH REDIRECT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn logout_resets_synchronously() {
    let h = signed_in_harness(profile_response(&["venue"], Some("venue"), true)).await;

    h.ctx.logout();
    assert!(!h.ctx.is_system_ready());
    assert!(h.ctx.is_hydrating());
    let user = h.ctx.current_user();
    assert_eq!(user.session, Session::unknown());
    assert!(user.profile.is_none());
    assert_eq!(h.ctx.evaluate("/venue/dashboard"), Decision::Loading);

    let decision = h.ctx.resolve("/venue/dashboard").await;
    assert_eq!(decision, Decision::redirect("/login?redirect=%2Fvenue%2Fdashboard"));
}

#[tokio::test(start_paused = true)]
async fn post_auth_redirect_returns_to_intended_path() {
    let h = boot(profile_response(&["venue"], Some("venue"), true)).await;
    assert_eq!(
        h.ctx.resolve("/venue/shifts").await,
        Decision::redirect("/login?redirect=%2Fvenue%2Fshifts")
    );

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    assert_eq!(h.ctx.trigger_post_auth_redirect().await, Decision::redirect("/venue/shifts"));
    // Consumed.
    assert_eq!(h.ctx.trigger_post_auth_redirect().await, Decision::redirect("/venue/dashboard"));
}

#[tokio::test(start_paused = true)]
async fn post_auth_redirect_skips_disallowed_intended_path() {
    let h = boot(profile_response(&["professional"], Some("professional"), true)).await;
    h.ctx.resolve("/shifts/new").await;

    h.provider.push(signed_in("alice"));
    wait_until(&h.ctx, LIMIT, ready_with_profile).await;
    assert_eq!(h.ctx.trigger_post_auth_redirect().await, Decision::redirect("/professional/dashboard"));
}

#[tokio::test(start_paused = true)]
async fn post_auth_redirect_sends_new_user_to_onboarding() {
    let h = signed_in_harness(profile_response(&[], None, false)).await;
    assert_eq!(h.ctx.trigger_post_auth_redirect().await, Decision::redirect("/onboarding"));
}

#[tokio::test(start_paused = true)]
async fn post_auth_redirect_without_role_goes_to_role_selection() {
    let h = signed_in_harness(profile_response(&["venue"], None, true)).await;
    assert_eq!(h.ctx.trigger_post_auth_redirect().await, Decision::redirect("/select-role"));
}
