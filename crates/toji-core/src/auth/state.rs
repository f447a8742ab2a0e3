use serde::{Deserialize, Serialize};

/// Where the guard is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Validating,
    Valid,
    Invalid,
}

/// Identity shown for a validated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct SessionUser {
    pub user_id: i64,
    pub username: String,
}

impl SessionUser {
    pub fn new(user_id: Option<i64>, username: Option<String>) -> Self {
        Self {
            user_id: user_id.unwrap_or_default(),
            username: username.unwrap_or_default(),
        }
    }
}

/// Observable session state. Only the guard writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct SessionState {
    pub token: Option<String>,
    pub phase: SessionPhase,
    pub remaining_secs: u64,
    pub user: Option<SessionUser>,
}

impl SessionState {
    pub fn is_valid(&self) -> bool {
        self.phase == SessionPhase::Valid
    }

    pub fn is_validating(&self) -> bool {
        self.phase == SessionPhase::Validating
    }

    /// Fresh state for a newly acquired token
    pub(crate) fn validating(token: String) -> Self {
        Self {
            token: Some(token),
            phase: SessionPhase::Validating,
            remaining_secs: 0,
            user: None,
        }
    }

    /// Mark invalid, keeping the token so callers can tell which one failed
    pub(crate) fn invalidate(&mut self) {
        self.phase = SessionPhase::Invalid;
        self.remaining_secs = 0;
        self.user = None;
    }

    /// Reset to empty after logout or countdown exhaustion
    pub(crate) fn clear(&mut self) {
        self.token = None;
        self.invalidate();
    }
}
