//! Shared types

pub mod error;

pub use error::{ErrorKind, Result, UserAction, VestibuleError};

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
