//! Core library for toji sessions.
//!
//! A session is a bot-issued bearer token. This crate decodes its claims,
//! decides whether it is still valid (locally when the token says when it
//! expires, otherwise by asking the backend), persists it, and runs the
//! countdown that logs the user out when it runs out.

pub mod api;
pub mod auth;
pub mod config;
pub mod utils;

pub use api::{ApiClient, ApiError, SessionValidator, ValidationResponse};
pub use auth::{
    GuardOptions, Notice, Notifier, SessionError, SessionGuard, SessionPhase, SessionState,
    SessionUser, TokenStore,
};
pub use config::Config;
