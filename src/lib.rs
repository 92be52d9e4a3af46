//! shiftgate: auth hydration and role-gated routing for the shift marketplace.
//!
//! ARCHITECTURE
//! ============
//! Leaves first: `identity` (provider session signal) and `profile` (backend
//! hydration) feed `readiness`; `timeout` bounds how long readiness may stay
//! unsettled; `roles` resolves role tokens; `gate` turns all of it into a
//! Render / Redirect / Loading decision. `context` owns the lot for one
//! visitor and `routes` exposes it over HTTP.

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod identity;
pub mod profile;
pub mod readiness;
pub mod roles;
pub mod routes;
pub mod store;
pub mod timeout;

#[cfg(test)]
pub mod test_helpers;
