use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::api::ApiError;

/// Why a session ended up invalid.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No session token")]
    NoToken,

    #[error("Session expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Backend rejected session: {}", .0.as_deref().unwrap_or("no reason given"))]
    Rejected(Option<String>),

    #[error("Backend validation timed out after {0}s")]
    Timeout(u64),

    #[error("Backend validation failed: {0}")]
    Remote(#[from] ApiError),

    #[error("Validation superseded by a newer token or logout")]
    Cancelled,
}

impl SessionError {
    /// Whether this outcome reached a terminal verdict for the token and
    /// should be surfaced to the user.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionError::NoToken | SessionError::Cancelled)
    }
}
