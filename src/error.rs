//! Shared error classification.
//!
//! Module errors stay local (`IdentityError`, `HydrationError`, ...) and
//! implement [`ErrorCode`] so the HTTP surface and logs can report a grepable
//! code plus a retryable flag without matching on every enum.

/// Grepable error code and retryable flag for structured error responses.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
