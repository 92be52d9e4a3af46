//! HTTP surface for the UI shell.
//!
//! SYSTEM CONTEXT
//! ==============
//! The shell forwards identity-provider callbacks to `POST /api/identity`
//! and asks `GET /api/gate?path=...` before rendering each protected page.
//! Everything else mirrors the context's exposed operations.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::{AuthContext, ContextError, CurrentUser};
use crate::error::ErrorCode;
use crate::gate::{Decision, GateState};
use crate::identity::provider::{ProviderEvent, ProviderSession, PushIdentityProvider};
use crate::readiness::ReadinessState;

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthContext,
    pub identity: Arc<PushIdentityProvider>,
}

impl AppState {
    #[must_use]
    pub fn new(auth: AuthContext, identity: Arc<PushIdentityProvider>) -> Self {
        Self { auth, identity }
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/identity", post(push_identity))
        .route("/api/auth/state", get(auth_state))
        .route("/api/gate", get(gate))
        .route("/api/auth/role", post(switch_role))
        .route("/api/auth/onboarding", post(complete_onboarding))
        .route("/api/auth/redirect", post(post_auth_redirect))
        .route("/api/auth/logout", post(logout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// One provider callback. A missing `identityId` means signed out.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPush {
    #[serde(default)]
    identity_id: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStateResponse {
    #[serde(flatten)]
    readiness: ReadinessState,
    gate: GateState,
    current_user: CurrentUser,
}

#[derive(Debug, Deserialize)]
pub struct GateQuery {
    path: String,
    /// Block until the gate commits (bounded by the hard timeout).
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoleSwitchBody {
    role: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    retryable: bool,
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /api/identity`: forward a provider session push.
async fn push_identity(State(state): State<AppState>, Json(body): Json<IdentityPush>) -> StatusCode {
    let event = match body.identity_id.filter(|id| !id.trim().is_empty()) {
        Some(identity_id) => ProviderEvent::SignedIn(ProviderSession { identity_id, access_token: body.access_token }),
        None => ProviderEvent::SignedOut,
    };
    state.identity.push(event);
    StatusCode::ACCEPTED
}

/// `GET /api/auth/state`: readiness flags, gate state and user snapshot.
async fn auth_state(State(state): State<AppState>) -> Json<AuthStateResponse> {
    Json(AuthStateResponse {
        readiness: state.auth.readiness(),
        gate: state.auth.gate_state(),
        current_user: state.auth.current_user(),
    })
}

/// `GET /api/gate?path=/venue/dashboard[&wait=true]`
async fn gate(State(state): State<AppState>, Query(query): Query<GateQuery>) -> Json<Decision> {
    let decision = if query.wait {
        state.auth.resolve(&query.path).await
    } else {
        state.auth.evaluate(&query.path)
    };
    Json(decision)
}

/// `POST /api/auth/role`: `{"role": "venue"}`
async fn switch_role(State(state): State<AppState>, Json(body): Json<RoleSwitchBody>) -> Response {
    match state.auth.trigger_role_switch(&body.role).await {
        Ok(user) => Json(user).into_response(),
        Err(e) => context_error_response(&e),
    }
}

/// `POST /api/auth/onboarding`: body forwarded to the backend as-is.
async fn complete_onboarding(State(state): State<AppState>, Json(payload): Json<serde_json::Value>) -> Response {
    match state.auth.complete_onboarding(payload).await {
        Ok(user) => Json(user).into_response(),
        Err(e) => context_error_response(&e),
    }
}

/// `POST /api/auth/redirect`: destination after sign-in.
async fn post_auth_redirect(State(state): State<AppState>) -> Json<Decision> {
    Json(state.auth.trigger_post_auth_redirect().await)
}

/// `POST /api/auth/logout`
async fn logout(State(state): State<AppState>) -> StatusCode {
    state.auth.logout();
    StatusCode::NO_CONTENT
}

pub(crate) fn context_error_status(err: &ContextError) -> StatusCode {
    match err {
        ContextError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        ContextError::InvalidRole(_) => StatusCode::BAD_REQUEST,
        ContextError::Mutation(e) if e.retryable() => StatusCode::SERVICE_UNAVAILABLE,
        ContextError::Mutation(_) => StatusCode::BAD_GATEWAY,
        ContextError::Cancelled => StatusCode::CONFLICT,
    }
}

fn context_error_response(err: &ContextError) -> Response {
    let body = ErrorBody { code: err.error_code(), message: err.to_string(), retryable: err.retryable() };
    (context_error_status(err), Json(body)).into_response()
}

#[cfg(test)]
#[path = "routes_test.rs"]
mod tests;
