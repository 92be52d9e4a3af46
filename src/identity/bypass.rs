//! Test-mode auth bypass.
//!
//! End-to-end suites run without a real provider session. The bypass needs
//! BOTH the `E2E_AUTH_BYPASS` flag and a synthetic user record in the local
//! store; either one alone is inert. Activation is always logged.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::profile::Profile;
use crate::store::{LocalStore, SYNTHETIC_USER_KEY};

/// Synthetic user record written by the e2e harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticUser {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub current_role: Option<String>,
    #[serde(default)]
    pub is_onboarded: bool,
}

impl SyntheticUser {
    #[must_use]
    pub fn into_profile(self) -> Profile {
        Profile {
            user_id: self.user_id,
            roles: self.roles.into_iter().collect::<BTreeSet<_>>(),
            current_role: self.current_role,
            is_onboarded: self.is_onboarded,
            venue: None,
            capabilities: Vec::new(),
        }
    }
}

/// Load the synthetic profile if the bypass is armed.
#[must_use]
pub fn load_bypass(enabled: bool, store: &dyn LocalStore) -> Option<Profile> {
    if !enabled {
        return None;
    }
    let Some(raw) = store.get(SYNTHETIC_USER_KEY) else {
        warn!("E2E_AUTH_BYPASS set but no synthetic user stored; bypass inert");
        return None;
    };
    match serde_json::from_str::<SyntheticUser>(&raw) {
        Ok(user) => {
            warn!(user_id = %user.user_id, "test-mode auth bypass ACTIVE");
            Some(user.into_profile())
        }
        Err(e) => {
            warn!(error = %e, "synthetic user record unreadable; bypass inert");
            None
        }
    }
}

#[cfg(test)]
#[path = "bypass_test.rs"]
mod tests;
