//! HTTP client for the session backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Url};
use tracing::debug;

use super::{ApiError, SessionValidator, ValidationResponse};
use crate::utils::token_preview;

/// Default backend location when nothing is configured
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Path of the session validation endpoint, relative to the API base
const VALIDATE_PATH: &str = "api/session/validate";

/// HTTP request timeout in seconds.
/// Backstop only: the guard applies its own, shorter bounds per call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// API client for the session backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: Self::parse_base_url(base_url)?,
        })
    }

    /// Parse the base URL, forcing a trailing slash so `join` appends
    /// instead of replacing the last path segment.
    fn parse_base_url(base_url: &str) -> Result<Url, ApiError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        Url::parse(&normalized)
            .map_err(|e| ApiError::InvalidUrl(format!("'{}': {}", base_url, e)))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Full URL of the validation endpoint
    pub fn validate_url(&self) -> Result<Url, ApiError> {
        self.base_url
            .join(VALIDATE_PATH)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl SessionValidator for ApiClient {
    async fn validate(&self, token: &str) -> Result<ValidationResponse, ApiError> {
        let url = self.validate_url()?;
        debug!(url = %url, token = %token_preview(token), "Validating session with backend");

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .query(&[("session_token", token)])
            .send()
            .await?;

        let response = Self::check_response(response).await?;

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse validation response: {}", e)))
    }
}
