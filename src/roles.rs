//! Role normalization and route eligibility.
//!
//! DESIGN
//! ======
//! Role tokens drift across product renames ("venue", "hub", "business" all
//! mean the same access category). Aliasing lives in one closed table,
//! [`RoleAliases`], and every check goes through [`RoleResolver::normalize`]
//! instead of comparing strings at call sites.
//!
//! SECURITY
//! ========
//! Unknown tokens fail closed. The only way past a role check without a
//! matching role is a backend-issued [`Capability`] of kind
//! [`CapabilityKind::RoleOverride`], and every use of one is written to the
//! `audit` log target with its own audit id.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::gate::policy::RoutePolicy;
use crate::profile::Profile;

/// Access category a role token resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCategory {
    Worker,
    Business,
    Admin,
}

impl RoleCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Business => "business",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoleError {
    #[error("invalid role token: {0:?}")]
    InvalidRoleToken(String),
}

impl ErrorCode for RoleError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRoleToken(_) => "E_INVALID_ROLE_TOKEN",
        }
    }
}

// =============================================================================
// ALIASES
// =============================================================================

/// Closed alias sets, one per category. Tokens are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAliases {
    worker: Vec<String>,
    business: Vec<String>,
    admin: Vec<String>,
}

impl Default for RoleAliases {
    fn default() -> Self {
        Self {
            worker: vec!["worker".into(), "professional".into()],
            business: vec!["business".into(), "venue".into(), "hub".into()],
            admin: vec!["admin".into()],
        }
    }
}

impl RoleAliases {
    /// Replace the alias set for one category.
    pub fn set(&mut self, category: RoleCategory, tokens: Vec<String>) {
        let tokens = tokens
            .into_iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .collect();
        match category {
            RoleCategory::Worker => self.worker = tokens,
            RoleCategory::Business => self.business = tokens,
            RoleCategory::Admin => self.admin = tokens,
        }
    }

    #[must_use]
    pub fn tokens(&self, category: RoleCategory) -> &[String] {
        match category {
            RoleCategory::Worker => &self.worker,
            RoleCategory::Business => &self.business,
            RoleCategory::Admin => &self.admin,
        }
    }

    // Admin is checked first so a token misconfigured into two sets never
    // grants less than the most privileged reading.
    fn lookup(&self, token: &str) -> Option<RoleCategory> {
        [RoleCategory::Admin, RoleCategory::Business, RoleCategory::Worker]
            .into_iter()
            .find(|category| self.tokens(*category).iter().any(|t| t == token))
    }
}

// =============================================================================
// CAPABILITIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Bypass route role requirements. Issued by the backend, never inferred.
    RoleOverride,
    #[serde(other)]
    Unknown,
}

/// Backend-issued capability claim carried on the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub kind: CapabilityKind,
    pub granted_by: String,
    /// Milliseconds since Unix epoch.
    pub granted_at_ms: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// RESOLVER
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct RoleResolver {
    aliases: RoleAliases,
}

impl RoleResolver {
    #[must_use]
    pub fn new(aliases: RoleAliases) -> Self {
        Self { aliases }
    }

    /// Resolve a raw role token to its access category.
    pub fn normalize(&self, token: &str) -> Result<RoleCategory, RoleError> {
        let key = token.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(RoleError::InvalidRoleToken(token.to_string()));
        }
        self.aliases
            .lookup(&key)
            .ok_or_else(|| RoleError::InvalidRoleToken(token.to_string()))
    }

    /// Like [`Self::normalize`], but logs and swallows invalid tokens.
    fn category_or_deny(&self, token: &str) -> Option<RoleCategory> {
        match self.normalize(token) {
            Ok(category) => Some(category),
            Err(e) => {
                warn!(error = %e, "role check denied");
                None
            }
        }
    }

    /// Category of the profile's current role, if it is usable.
    #[must_use]
    pub fn current_category(&self, user: &Profile) -> Option<RoleCategory> {
        user.usable_current_role()
            .and_then(|role| self.category_or_deny(role))
    }

    /// Whether the user may see a route guarded by `policy`.
    #[must_use]
    pub fn eligible(&self, user: &Profile, policy: &RoutePolicy) -> bool {
        if policy.required_role.is_none() && policy.allowed_roles.is_empty() {
            return true;
        }

        let required_ok = policy
            .required_role
            .as_deref()
            .is_none_or(|required| self.matches_any(user, &[required]));
        let allowed_ok = policy.allowed_roles.is_empty() || {
            let allowed: Vec<&str> = policy.allowed_roles.iter().map(String::as_str).collect();
            self.matches_any(user, &allowed)
        };
        if required_ok && allowed_ok {
            return true;
        }

        if let Some(cap) = user
            .capabilities
            .iter()
            .find(|c| c.kind == CapabilityKind::RoleOverride)
        {
            info!(
                target: "audit",
                audit_id = %Uuid::new_v4(),
                user_id = %user.user_id,
                granted_by = %cap.granted_by,
                granted_at_ms = cap.granted_at_ms,
                reason = cap.reason.as_deref().unwrap_or(""),
                required_role = policy.required_role.as_deref().unwrap_or(""),
                "role override capability used"
            );
            return true;
        }
        false
    }

    /// True when the current role, or any held role, shares a category with one of `wanted`.
    fn matches_any(&self, user: &Profile, wanted: &[&str]) -> bool {
        let wanted: Vec<RoleCategory> = wanted
            .iter()
            .filter_map(|token| self.category_or_deny(token))
            .collect();
        if wanted.is_empty() {
            return false;
        }
        if self
            .current_category(user)
            .is_some_and(|current| wanted.contains(&current))
        {
            return true;
        }
        user.roles
            .iter()
            .filter_map(|role| self.category_or_deny(role))
            .any(|held| wanted.contains(&held))
    }
}

#[cfg(test)]
#[path = "roles_test.rs"]
mod tests;
