//! Declarative route policies.
//!
//! Every protected page is declared once in a [`RouteTable`]. Patterns are
//! either exact paths (`/settings`) or prefixes ending in `/*`
//! (`/venue/*`); the longest matching pattern wins and unmatched paths are
//! public.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::roles::RoleCategory;

/// Per-route access requirements. Immutable once declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicy {
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub required_role: Option<String>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Replaces the unauthorized target for role mismatches on this route.
    #[serde(default)]
    pub redirect_to: Option<String>,
}

impl RoutePolicy {
    #[must_use]
    pub fn public() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn authenticated() -> Self {
        Self { require_auth: true, ..Self::default() }
    }

    #[must_use]
    pub fn role(required: &str) -> Self {
        Self { require_auth: true, required_role: Some(required.to_string()), ..Self::default() }
    }

    #[must_use]
    pub fn any_of(allowed: &[&str]) -> Self {
        Self {
            require_auth: true,
            allowed_roles: allowed.iter().map(|r| (*r).to_string()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_redirect(mut self, target: &str) -> Self {
        self.redirect_to = Some(target.to_string());
        self
    }
}

// =============================================================================
// WELL-KNOWN PATHS
// =============================================================================

/// Paths the gate redirects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePaths {
    pub login: String,
    pub signup: String,
    pub onboarding: String,
    pub role_selection: String,
    pub unauthorized: String,
    /// View rendered in place when a redirect loop is detected.
    pub fallback: String,
    pub worker_dashboard: String,
    pub business_dashboard: String,
    pub admin_dashboard: String,
}

impl Default for GatePaths {
    fn default() -> Self {
        Self {
            login: "/login".into(),
            signup: "/signup".into(),
            onboarding: "/onboarding".into(),
            role_selection: "/select-role".into(),
            unauthorized: "/unauthorized".into(),
            fallback: "/unavailable".into(),
            worker_dashboard: "/professional/dashboard".into(),
            business_dashboard: "/venue/dashboard".into(),
            admin_dashboard: "/admin".into(),
        }
    }
}

impl GatePaths {
    #[must_use]
    pub fn dashboard_for(&self, category: RoleCategory) -> &str {
        match category {
            RoleCategory::Worker => &self.worker_dashboard,
            RoleCategory::Business => &self.business_dashboard,
            RoleCategory::Admin => &self.admin_dashboard,
        }
    }

    /// Login and signup pages, where an authenticated user is sent home.
    #[must_use]
    pub fn is_auth_page(&self, path: &str) -> bool {
        path == self.login || path == self.signup
    }
}

/// Strip query string, fragment and trailing slash so `/a/?x=1` and `/a` compare equal.
#[must_use]
pub fn normalize_path(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let trimmed = path[..end].trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

// =============================================================================
// ROUTE TABLE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub pattern: String,
    #[serde(flatten)]
    pub policy: RoutePolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn route(mut self, pattern: &str, policy: RoutePolicy) -> Self {
        self.routes.push(RouteEntry { pattern: pattern.to_string(), policy });
        self
    }

    /// Routes of the shift marketplace.
    #[must_use]
    pub fn marketplace(paths: &GatePaths) -> Self {
        Self::new()
            .route(&paths.onboarding, RoutePolicy::authenticated())
            .route(&paths.role_selection, RoutePolicy::authenticated())
            .route("/dashboard", RoutePolicy::authenticated())
            .route("/settings/*", RoutePolicy::authenticated())
            .route("/messages/*", RoutePolicy::authenticated())
            .route("/professional/*", RoutePolicy::role("professional"))
            .route("/venue/*", RoutePolicy::role("venue"))
            .route("/shifts/new", RoutePolicy::role("business"))
            .route("/shifts/*", RoutePolicy::any_of(&["worker", "business"]))
            .route("/admin/*", RoutePolicy::role("admin").with_redirect("/dashboard"))
            .route(&paths.admin_dashboard, RoutePolicy::role("admin").with_redirect("/dashboard"))
    }

    /// Parse a JSON route table: `{"routes": [{"pattern": "/venue/*", "requireAuth": true, ...}]}`.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::RouteTable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&raw).map_err(|e| ConfigError::RouteTable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Policy for `path`; public when nothing matches.
    #[must_use]
    pub fn policy_for(&self, path: &str) -> RoutePolicy {
        let path = normalize_path(path);
        self.routes
            .iter()
            .filter_map(|entry| pattern_specificity(&entry.pattern, path).map(|score| (score, entry)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, entry)| entry.policy.clone())
            .unwrap_or_default()
    }
}

// Exact matches outrank any prefix; longer prefixes outrank shorter ones.
fn pattern_specificity(pattern: &str, path: &str) -> Option<usize> {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let matches = path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'));
        return matches.then_some(prefix.len());
    }
    (normalize_path(pattern) == path).then_some(usize::MAX)
}

#[cfg(test)]
#[path = "policy_test.rs"]
mod tests;
