//! Session handling for bot-issued bearer tokens.
//!
//! This module provides:
//! - `decode`: read the claims inside a token without verifying it
//! - `SessionGuard`: validity, remaining lifetime and the logout countdown
//! - `TokenStore`: the persisted token slot (file, keychain or memory)
//! - `Notifier`: sink for the "session expired" / "logged out" notices

pub mod credentials;
pub mod error;
pub mod guard;
pub mod notice;
pub mod source;
pub mod state;
pub mod store;
pub mod timestamp;
pub mod token;

pub use credentials::KeyringTokenStore;
pub use error::SessionError;
pub use guard::{GuardOptions, SessionGuard};
pub use notice::{Notice, Notifier, TracingNotifier};
pub use source::{resolve_token, take_session_param, SESSION_PARAM};
pub use state::{SessionPhase, SessionState, SessionUser};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use timestamp::parse_instant;
pub use token::{decode, SessionPayload, TokenError};
