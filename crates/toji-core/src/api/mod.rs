//! REST API client module for the session backend.
//!
//! This module provides the `SessionValidator` seam the guard calls
//! through, and `ApiClient`, its HTTP implementation against
//! `GET /api/session/validate?session_token=...`.

pub mod client;
pub mod error;
pub mod validator;

pub use client::{ApiClient, DEFAULT_API_URL};
pub use error::ApiError;
pub use validator::{SessionValidator, ValidationResponse};
