//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Every variant carries a
//! human-readable message and maps to a stable machine-readable code that is
//! surfaced in JSON command reports.

use thiserror::Error;

/// Application error type
///
/// Covers every failure the composition, delivery and draft pipeline may
/// report. Post-send persistence and verification problems are not errors;
/// they are recorded in the delivery report instead.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (missing recipients, unreadable attachment, bad draft)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Configuration problem (unknown provider, missing account variables)
    #[error("configuration error: {0}")]
    Config(String),
    /// Resource not found (account, mailbox, message UID, draft file)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, rejected sender alias)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// SMTP session failure (connect, STARTTLS, RCPT rejection, DATA)
    #[error("transport error: {0}")]
    Transport(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `Config`
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable code for structured output
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_input`
    /// - `Config` → `config`
    /// - `NotFound` → `not_found`
    /// - `AuthFailed` → `auth_failed`
    /// - `Timeout` → `timeout`
    /// - `Transport` → `transport`
    /// - `Internal` → `internal`
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Internal(_) => "internal",
        }
    }

    /// Process exit status for the CLI
    ///
    /// Input and configuration problems exit with `2`, everything else with `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) | Self::Config(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("i/o error: {err}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::invalid("x").code(), "invalid_input");
        assert_eq!(AppError::config("x").code(), "config");
        assert_eq!(AppError::Transport("x".into()).code(), "transport");
        assert_eq!(AppError::Timeout("x".into()).code(), "timeout");
    }

    #[test]
    fn input_errors_exit_with_usage_status() {
        assert_eq!(AppError::invalid("no recipients").exit_code(), 2);
        assert_eq!(AppError::config("unknown provider").exit_code(), 2);
        assert_eq!(AppError::Internal("boom".into()).exit_code(), 1);
    }
}
