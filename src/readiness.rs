//! Readiness aggregation.
//!
//! Pure derivation from the identity signal, the hydrator and the mutation
//! tracker. Nothing sets readiness directly; timers move the *inputs* into
//! terminal states instead, so `is_system_ready` always implies a known
//! session.

use serde::Serialize;

use crate::identity::IdentityStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessInputs {
    pub identity: IdentityStatus,
    /// Test-mode bypass armed with a synthetic user.
    pub bypass_active: bool,
    /// Profile hydration has reached success or failure.
    pub hydration_terminal: bool,
    pub mutations_in_flight: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessState {
    /// Session itself is still unknown. No redirect may fire.
    pub is_hydrating: bool,
    pub is_loading: bool,
    /// A role switch or onboarding submit is round-tripping.
    pub is_transitioning: bool,
    pub is_system_ready: bool,
}

#[must_use]
pub fn aggregate(inputs: &ReadinessInputs) -> ReadinessState {
    let is_transitioning = inputs.mutations_in_flight > 0;
    let identity_settled = if inputs.bypass_active {
        true
    } else {
        match inputs.identity {
            IdentityStatus::Unknown => false,
            IdentityStatus::Absent => true,
            IdentityStatus::Present => inputs.hydration_terminal,
        }
    };
    let is_system_ready = identity_settled && !is_transitioning;
    ReadinessState {
        is_hydrating: inputs.identity == IdentityStatus::Unknown && !inputs.bypass_active,
        is_loading: !is_system_ready,
        is_transitioning,
        is_system_ready,
    }
}
