use std::fmt;

use tracing::{info, warn};

/// User-visible notices raised on terminal session transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    SessionExpired,
    LoggedOut,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SessionExpired => {
                write!(f, "Session expired. Please create a new session from the bot.")
            }
            Notice::LoggedOut => write!(f, "Logged out successfully"),
        }
    }
}

/// Sink for notices. Called synchronously from the guard, so
/// implementations should hand off rather than block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::SessionExpired => warn!(notice = %notice, "Session notice"),
            Notice::LoggedOut => info!(notice = %notice, "Session notice"),
        }
    }
}
