//! Error types for Vestibule
//!
//! One enum for the whole coordinator, with a stable wire kind for the
//! outbound result envelope.

use serde::{Deserialize, Serialize};

/// Main error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum VestibuleError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Wallet is locked")]
    Locked,

    #[error("Origin is not connected: {0}")]
    NotConnected(String),

    #[error("Connect request timed out for origin {0}")]
    ConnectTimeout(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Input size error: expected {expected} bytes, got {actual}")]
    InputSize { expected: usize, actual: usize },

    /// The request left the queue but its effect failed; it may or may not
    /// have settled downstream.
    #[error("Approved request {request_id} failed: {reason}")]
    ApprovedButFailed { request_id: String, reason: String },

    #[error("Migration incomplete: {0}")]
    MigrationPartial(String),

    #[error("Name binding drifted: {0}")]
    BindingDrifted(String),

    #[error("Name binding unreachable: {0}")]
    BindingUnreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error identifiers carried in the result envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthError,
    Locked,
    NotConnected,
    ConnectTimeout,
    Cancelled,
    IdentityError,
    InputSizeError,
    ApprovedButFailed,
    MigrationPartial,
    BindingDrifted,
    BindingUnreachable,
    NotFound,
    InvalidRequest,
    UserRejected,
    Internal,
}

/// What the surface should offer the user for a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    /// Safe to try again
    Retry,
    /// Do not retry before checking whether the transfer settled
    CheckSettlement,
    /// Nothing actionable
    Dismiss,
}

impl VestibuleError {
    /// Map to the wire error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::AuthError,
            Self::Locked => ErrorKind::Locked,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Identity(_) => ErrorKind::IdentityError,
            Self::InputSize { .. } => ErrorKind::InputSizeError,
            Self::ApprovedButFailed { .. } => ErrorKind::ApprovedButFailed,
            Self::MigrationPartial(_) => ErrorKind::MigrationPartial,
            Self::BindingDrifted(_) => ErrorKind::BindingDrifted,
            Self::BindingUnreachable(_) => ErrorKind::BindingUnreachable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Storage(_)
            | Self::Collaborator(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map to the affordance the approval surface should render
    pub fn user_action(&self) -> UserAction {
        match self {
            Self::Locked | Self::NotConnected(_) | Self::ConnectTimeout(_) => UserAction::Retry,
            Self::ApprovedButFailed { .. } => UserAction::CheckSettlement,
            _ => UserAction::Dismiss,
        }
    }

    /// Non-fatal conditions that are logged but never fail an unlock
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::MigrationPartial(_) | Self::BindingDrifted(_) | Self::BindingUnreachable(_)
        )
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for VestibuleError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VestibuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("JSON error: {}", err))
    }
}

impl From<sled::Error> for VestibuleError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, VestibuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approved_but_failed_is_distinct_from_rejection() {
        let err = VestibuleError::ApprovedButFailed {
            request_id: "req-1".into(),
            reason: "engine offline".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ApprovedButFailed);
        assert_ne!(err.kind(), ErrorKind::UserRejected);
        assert_eq!(err.user_action(), UserAction::CheckSettlement);
    }

    #[test]
    fn test_retryable_kinds() {
        assert_eq!(VestibuleError::Locked.user_action(), UserAction::Retry);
        assert_eq!(
            VestibuleError::NotConnected("https://a.example".into()).user_action(),
            UserAction::Retry
        );
        assert_eq!(
            VestibuleError::ConnectTimeout("https://a.example".into()).user_action(),
            UserAction::Retry
        );
        assert_eq!(VestibuleError::Auth("bad".into()).user_action(), UserAction::Dismiss);
    }

    #[test]
    fn test_warnings_do_not_include_auth() {
        assert!(VestibuleError::BindingDrifted("alice".into()).is_warning());
        assert!(VestibuleError::MigrationPartial("kv".into()).is_warning());
        assert!(!VestibuleError::Auth("bad".into()).is_warning());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ApprovedButFailed).unwrap();
        assert_eq!(json, "\"approved_but_failed\"");
    }
}
