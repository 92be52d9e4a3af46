//! Gate configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled default so the gate boots with no environment
//! at all. Tests build a [`GateConfig`] with `Default` and tweak fields.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::gate::policy::GatePaths;
use crate::roles::{RoleAliases, RoleCategory};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PROFILE_API_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_PROFILE_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROFILE_CONNECT_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_SOFT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_HARD_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 150;
pub const DEFAULT_TRANSIENT_NULL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_PROFILE_RETRY_DELAY_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("hard timeout ({hard_ms}ms) must be longer than soft timeout ({soft_ms}ms)")]
    TimeoutOrder { soft_ms: u64, hard_ms: u64 },
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("route table {path}: {reason}")]
    RouteTable { path: String, reason: String },
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::TimeoutOrder { .. } => "E_CONFIG_TIMEOUT_ORDER",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
            Self::RouteTable { .. } => "E_CONFIG_ROUTE_TABLE",
        }
    }
}

/// Backend profile API connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileApiConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Timer policy for the readiness supervisor and the route gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTimeouts {
    /// Soft timer: may resolve an unknown guest to unauthenticated.
    pub soft: Duration,
    /// Hard timer: forces a degraded-ready state.
    pub hard: Duration,
    /// Bounded wait before committing to a redirect.
    pub grace: Duration,
    /// Window in which a sign-out push right after sign-in is treated as a token refresh blip.
    pub transient_null_grace: Duration,
    /// Base delay before the single profile fetch retry.
    pub profile_retry_delay: Duration,
}

impl Default for GateTimeouts {
    fn default() -> Self {
        Self {
            soft: Duration::from_millis(DEFAULT_SOFT_TIMEOUT_MS),
            hard: Duration::from_millis(DEFAULT_HARD_TIMEOUT_MS),
            grace: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            transient_null_grace: Duration::from_millis(DEFAULT_TRANSIENT_NULL_GRACE_MS),
            profile_retry_delay: Duration::from_millis(DEFAULT_PROFILE_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub port: u16,
    pub profile_api: ProfileApiConfig,
    pub timeouts: GateTimeouts,
    /// Test-mode bypass flag. Inert unless a synthetic user record is also stored.
    pub e2e_bypass: bool,
    /// JSON file backing the local store. In-memory when `None`.
    pub local_store_path: Option<PathBuf>,
    /// JSON route table replacing the built-in marketplace routes.
    pub route_table_path: Option<PathBuf>,
    pub aliases: RoleAliases,
    pub paths: GatePaths,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            profile_api: ProfileApiConfig {
                base_url: DEFAULT_PROFILE_API_BASE_URL.to_string(),
                request_timeout_secs: DEFAULT_PROFILE_REQUEST_TIMEOUT_SECS,
                connect_timeout_secs: DEFAULT_PROFILE_CONNECT_TIMEOUT_SECS,
            },
            timeouts: GateTimeouts::default(),
            e2e_bypass: false,
            local_store_path: None,
            route_table_path: None,
            aliases: RoleAliases::default(),
            paths: GatePaths::default(),
        }
    }
}

impl GateConfig {
    /// Build typed gate config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `PROFILE_API_BASE_URL`, `PROFILE_API_TIMEOUT_SECS`, `PROFILE_API_CONNECT_TIMEOUT_SECS`
    /// - `SOFT_TIMEOUT_MS`, `HARD_TIMEOUT_MS`, `GRACE_PERIOD_MS`, `TRANSIENT_NULL_GRACE_MS`,
    ///   `PROFILE_RETRY_DELAY_MS`
    /// - `E2E_AUTH_BYPASS`: `1`/`true`/`yes`/`on` enables the test-mode bypass
    /// - `LOCAL_STORE_PATH`, `ROUTE_TABLE_PATH`
    /// - `ROLE_ALIASES_WORKER`, `ROLE_ALIASES_BUSINESS`, `ROLE_ALIASES_ADMIN`: comma lists
    /// - `PATH_LOGIN`, `PATH_SIGNUP`, `PATH_ONBOARDING`, `PATH_ROLE_SELECTION`,
    ///   `PATH_UNAUTHORIZED`, `PATH_FALLBACK`, `PATH_DASHBOARD_WORKER`,
    ///   `PATH_DASHBOARD_BUSINESS`, `PATH_DASHBOARD_ADMIN`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = env_parse("PORT", DEFAULT_PORT);
        let profile_api = ProfileApiConfig {
            base_url: std::env::var("PROFILE_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_PROFILE_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout_secs: env_parse("PROFILE_API_TIMEOUT_SECS", DEFAULT_PROFILE_REQUEST_TIMEOUT_SECS),
            connect_timeout_secs: env_parse("PROFILE_API_CONNECT_TIMEOUT_SECS", DEFAULT_PROFILE_CONNECT_TIMEOUT_SECS),
        };

        let timeouts = GateTimeouts {
            soft: Duration::from_millis(env_parse("SOFT_TIMEOUT_MS", DEFAULT_SOFT_TIMEOUT_MS)),
            hard: Duration::from_millis(env_parse("HARD_TIMEOUT_MS", DEFAULT_HARD_TIMEOUT_MS)),
            grace: Duration::from_millis(env_parse("GRACE_PERIOD_MS", DEFAULT_GRACE_PERIOD_MS)),
            transient_null_grace: Duration::from_millis(env_parse(
                "TRANSIENT_NULL_GRACE_MS",
                DEFAULT_TRANSIENT_NULL_GRACE_MS,
            )),
            profile_retry_delay: Duration::from_millis(env_parse(
                "PROFILE_RETRY_DELAY_MS",
                DEFAULT_PROFILE_RETRY_DELAY_MS,
            )),
        };
        validate_timeouts(&timeouts)?;

        let mut aliases = defaults.aliases;
        for (key, category) in [
            ("ROLE_ALIASES_WORKER", RoleCategory::Worker),
            ("ROLE_ALIASES_BUSINESS", RoleCategory::Business),
            ("ROLE_ALIASES_ADMIN", RoleCategory::Admin),
        ] {
            if let Ok(raw) = std::env::var(key) {
                let tokens = parse_token_list(&raw);
                if tokens.is_empty() {
                    return Err(ConfigError::Invalid { key, reason: "alias list is empty".into() });
                }
                aliases.set(category, tokens);
            }
        }

        let mut paths = defaults.paths;
        for (key, slot) in [
            ("PATH_LOGIN", &mut paths.login),
            ("PATH_SIGNUP", &mut paths.signup),
            ("PATH_ONBOARDING", &mut paths.onboarding),
            ("PATH_ROLE_SELECTION", &mut paths.role_selection),
            ("PATH_UNAUTHORIZED", &mut paths.unauthorized),
            ("PATH_FALLBACK", &mut paths.fallback),
            ("PATH_DASHBOARD_WORKER", &mut paths.worker_dashboard),
            ("PATH_DASHBOARD_BUSINESS", &mut paths.business_dashboard),
            ("PATH_DASHBOARD_ADMIN", &mut paths.admin_dashboard),
        ] {
            if let Ok(raw) = std::env::var(key) {
                *slot = parse_path(key, &raw)?;
            }
        }

        Ok(Self {
            port,
            profile_api,
            timeouts,
            e2e_bypass: env_bool("E2E_AUTH_BYPASS").unwrap_or(false),
            local_store_path: std::env::var("LOCAL_STORE_PATH").ok().map(PathBuf::from),
            route_table_path: std::env::var("ROUTE_TABLE_PATH").ok().map(PathBuf::from),
            aliases,
            paths,
        })
    }
}

fn validate_timeouts(timeouts: &GateTimeouts) -> Result<(), ConfigError> {
    if timeouts.hard <= timeouts.soft {
        return Err(ConfigError::TimeoutOrder {
            soft_ms: u64::try_from(timeouts.soft.as_millis()).unwrap_or(u64::MAX),
            hard_ms: u64::try_from(timeouts.hard.as_millis()).unwrap_or(u64::MAX),
        });
    }
    Ok(())
}

fn parse_token_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_path(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('/') {
        return Err(ConfigError::Invalid { key, reason: format!("path must start with '/': {trimmed}") });
    }
    Ok(trimmed.to_string())
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
